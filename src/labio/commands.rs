use labio::{
    BackendOptions, Conn, LabConfig, ParamValue, Registry, backend::seconds,
    error::CommResult, list_backend_resources,
};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub(crate) struct ListOptions {
    /// Only list resources of this backend kind
    #[clap(short, long)]
    kind: Option<String>,

    /// Print bare identifiers without descriptions
    #[clap(short, long, default_value_t = false)]
    raw: bool,
}

#[derive(Parser, Debug, Clone)]
pub(crate) struct AskOptions {
    /// Connection, e.g. COM3, "COM3,115200", 192.168.1.10:5025 or a VISA address
    conn: String,

    /// Query sent to the device
    query: String,

    /// Backend kind; auto detects it from the connection
    #[clap(short, long, default_value = "auto")]
    backend: String,

    /// Timeout in seconds
    #[clap(short, long)]
    timeout: Option<f64>,

    /// Write terminator (\r, \n and \t escapes are understood)
    #[clap(long)]
    term_write: Option<String>,

    /// Read terminator, may be repeated
    #[clap(long)]
    term_read: Vec<String>,

    /// Print everything received instead of a single line
    #[clap(long, default_value_t = false)]
    read_all: bool,

    /// Delay between query and read, in seconds
    #[clap(short, long)]
    delay: Option<f64>,
}

pub(crate) fn handle_list(opts: ListOptions) -> CommResult<()> {
    let resources = list_backend_resources(opts.kind.as_deref(), !opts.raw)?;
    for (kind, found) in resources {
        if opts.raw {
            for resource in found {
                println!("{}\t{}", kind, resource);
            }
            continue;
        }
        println!("{} ({} found)", kind, found.len());
        for resource in found {
            println!("  {}", resource);
        }
    }
    Ok(())
}

pub(crate) fn handle_ask(opts: AskOptions, config: &LabConfig) -> CommResult<()> {
    let mut options = config.backend_options()?;
    options = apply_overrides(options, &opts)?;
    let defaults = config.defaults();

    let mut dev = labio::new_backend(
        parse_conn(&opts.conn),
        &opts.backend,
        Some(&defaults),
        &options,
    )?;
    let delay = opts.delay.map(seconds).transpose()?;
    let reply = dev.ask(unescape(&opts.query).as_bytes(), delay, opts.read_all)?;
    dev.close()?;

    println!("{}", reply.to_text());
    Ok(())
}

pub(crate) fn handle_kinds() {
    for kind in Registry::global().available() {
        println!("{}", kind);
    }
}

fn apply_overrides(mut options: BackendOptions, opts: &AskOptions) -> CommResult<BackendOptions> {
    if let Some(timeout) = opts.timeout {
        options = options.timeout(seconds(timeout)?);
    }
    if let Some(term) = &opts.term_write {
        options = options.term_write(unescape(term));
    }
    if !opts.term_read.is_empty() {
        let terms: Vec<String> = opts.term_read.iter().map(|t| unescape(t)).collect();
        options = options.term_read(labio::terminator::Terminators::new(terms));
    }
    Ok(options)
}

/// Comma separated values become positional parameters
fn parse_conn(conn: &str) -> Conn {
    let values: Vec<ParamValue> = conn.split(',').map(|v| parse_value(v.trim())).collect();
    match <[ParamValue; 1]>::try_from(values) {
        Ok([value]) => Conn::Scalar(value),
        Err(values) => Conn::Positional(values),
    }
}

fn parse_value(value: &str) -> ParamValue {
    if let Ok(v) = value.parse::<i64>() {
        return ParamValue::Int(v);
    }
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        if let Ok(v) = i64::from_str_radix(hex, 16) {
            return ParamValue::Int(v);
        }
    }
    ParamValue::Str(value.to_owned())
}

fn unescape(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => result.push('\r'),
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_strings() {
        assert_eq!(parse_conn("COM3"), Conn::Scalar("COM3".into()));
        assert_eq!(
            parse_conn("COM3, 115200"),
            Conn::Positional(vec!["COM3".into(), ParamValue::Int(115200)])
        );
        assert_eq!(
            parse_conn("0x1313,0x8072"),
            Conn::Positional(vec![ParamValue::Int(0x1313), ParamValue::Int(0x8072)])
        );
    }

    #[test]
    fn escapes() {
        assert_eq!(unescape(r"\r\n"), "\r\n");
        assert_eq!(unescape(r"a\\b\"), "a\\b\\");
    }
}
