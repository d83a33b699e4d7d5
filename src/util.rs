use std::time::Duration;

use tracing::debug;

use crate::error::CommResult;

/// Call `f` up to `times` times (at least once), sleeping `delay` between
/// failed attempts. The last error is returned.
pub(crate) fn retry_wait<T, F>(mut f: F, times: u32, delay: Duration) -> CommResult<T>
where
    F: FnMut() -> CommResult<T>,
{
    let attempts = times.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                attempt += 1;
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::error::CommError;

    #[test]
    #[traced_test]
    fn retries_until_success() {
        let mut calls = 0;
        let value = retry_wait(
            || {
                calls += 1;
                if calls < 3 {
                    Err(CommError::Communication("busy".into()))
                } else {
                    Ok(calls)
                }
            },
            3,
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(value, 3);
        assert!(logs_contain("Attempt 2/3 failed: Communication error: busy"));
    }

    #[test]
    fn gives_up_with_last_error() {
        let mut calls = 0;
        let result: CommResult<()> = retry_wait(
            || {
                calls += 1;
                Err(CommError::Communication(format!("attempt {calls}")))
            },
            2,
            Duration::ZERO,
        );
        assert_eq!(calls, 2);
        assert!(result.unwrap_err().to_string().contains("attempt 2"));
    }

    #[test]
    fn zero_times_still_tries_once() {
        let mut calls = 0;
        let _ = retry_wait(
            || -> CommResult<()> {
                calls += 1;
                Ok(())
            },
            0,
            Duration::ZERO,
        );
        assert_eq!(calls, 1);
    }
}
