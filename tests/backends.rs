#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    use labio::backend::{NetworkBackend, SerialBackend, TimeoutGuard};
    use labio::cooldown::{CooldownTable, Operation};
    use labio::interface::memory::MemoryDevice;
    use labio::registry::RegistryEntry;
    use labio::{
        Backend, BackendDefaults, BackendOptions, CommError, CommResult, Conn, ConnParams,
        Connection, ParamValue, ReadlineOptions, Registry, autodetect_backend,
    };

    fn serial(dev: &MemoryDevice, opts: &BackendOptions) -> SerialBackend {
        SerialBackend::with_interface(Box::new(dev.clone()), SerialBackend::default_conn(), opts)
            .unwrap()
    }

    fn build_memory(params: ConnParams, opts: &BackendOptions) -> CommResult<Box<dyn Backend>> {
        Ok(Box::new(SerialBackend::with_interface(
            Box::new(MemoryDevice::new()),
            params,
            opts,
        )?))
    }

    fn memory_registry() -> Registry {
        let mut registry = Registry::empty();
        registry.register(
            "memory",
            RegistryEntry {
                fields: &["port", "baudrate", "bytesize"],
                defaults: ConnParams::new()
                    .with("port", "MEM0")
                    .with("baudrate", 9600)
                    .with("bytesize", 8),
                build: build_memory,
                list: None,
            },
        );
        registry
    }

    #[test]
    fn open_backend_is_passed_through() {
        let dev = MemoryDevice::new();
        let backend: Box<dyn Backend> = Box::new(serial(&dev, &BackendOptions::new()));
        let same = labio::new_backend(backend, "network", None, &BackendOptions::new()).unwrap();
        assert_eq!(same.kind(), "serial");
        assert_eq!(dev.opens(), 1);
    }

    #[test]
    fn autodetection() {
        let detect = |conn: Conn| autodetect_backend(&conn, "visa");
        assert_eq!(detect("COM3".into()), "serial");
        assert_eq!(detect(("com12", 115200).into()), "serial");
        assert_eq!(detect("192.168.1.10:5025".into()), "network");
        assert_eq!(detect(("10.0.0.2", 5025).into()), "network");
        assert_eq!(detect((0x1313, 0x8072).into()), "pyusb");
        assert_eq!(detect("USB0::0x0957::0x1734::MY44007041::INSTR".into()), "visa");
        assert_eq!(detect((0x1313, 70000).into()), "visa");
        assert_eq!(
            detect(Conn::Named(ConnParams::new().with("addr", "10.0.0.2"))),
            "network"
        );
    }

    #[test]
    fn factory_merges_defaults() {
        let registry = memory_registry();
        let mut defaults = BackendDefaults::new();
        defaults.insert("memory".into(), ("MEM1", 115200).into());

        let backend = registry
            .new_backend("MEM7", "memory", Some(&defaults), &BackendOptions::new())
            .unwrap();
        let params = backend.params();
        assert_eq!(params.get("port"), Some(&ParamValue::Str("MEM7".into())));
        assert_eq!(params.get("baudrate"), Some(&ParamValue::Int(115200)));
        assert_eq!(params.get("bytesize"), Some(&ParamValue::Int(8)));

        let tagged = registry
            .new_backend(
                Connection::tagged("memory", "MEM3"),
                "serial",
                Some(&defaults),
                &BackendOptions::new(),
            )
            .unwrap();
        assert_eq!(tagged.params().get("baudrate"), Some(&ParamValue::Int(115200)));

        let tagged = registry
            .new_backend(("memory", "MEM2"), "serial", None, &BackendOptions::new())
            .unwrap();
        assert_eq!(tagged.params().get("port"), Some(&ParamValue::Str("MEM2".into())));

        let err = registry
            .new_backend("MEM0", "serial", None, &BackendOptions::new())
            .unwrap_err();
        assert!(matches!(err, CommError::Validation(_)));
        let err = registry
            .new_backend(
                Conn::Positional(vec![
                    "MEM0".into(),
                    ParamValue::Int(9600),
                    ParamValue::Int(8),
                    ParamValue::Int(1),
                ]),
                "memory",
                None,
                &BackendOptions::new(),
            )
            .unwrap_err();
        assert!(matches!(err, CommError::Validation(_)));
    }

    #[test]
    fn listing_unlistable_kind_is_unsupported() {
        let registry = memory_registry();
        let err = registry.list_backend_resources(Some("memory"), false).unwrap_err();
        assert!(matches!(err, CommError::Unsupported(_)));
        assert!(registry.list_backend_resources(None, false).unwrap().is_empty());
    }

    #[test]
    fn scoped_timeout_survives_errors() {
        let dev = MemoryDevice::new();
        let mut backend = serial(&dev, &BackendOptions::new().timeout(Duration::from_secs(3)));

        let result: CommResult<_> = (|| {
            let mut scoped = TimeoutGuard::new(&mut backend, Some(Duration::from_millis(20)))?;
            assert_eq!(scoped.timeout(), Some(Duration::from_millis(20)));
            scoped.readline()
        })();
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(backend.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn read_waits_for_cooldown() {
        let dev = MemoryDevice::new();
        let mut table = CooldownTable::new();
        table.set(Operation::Read, Duration::from_millis(50));
        let mut backend = serial(&dev, &BackendOptions::new().cooldown(table));

        dev.push(b"value\n");
        let start = Instant::now();
        assert_eq!(backend.readline().unwrap().as_bytes(), b"value");
        assert!(start.elapsed() >= Duration::from_millis(50));

        backend.setup_cooldown("all", 0.0).unwrap();
        assert_eq!(backend.cooldowns().get(Operation::Read), Duration::ZERO);
    }

    #[test]
    fn fixed_size_read_mismatch() {
        let dev = MemoryDevice::new();
        let mut backend = serial(&dev, &BackendOptions::new());
        dev.push(b"abc");
        let err = backend.read(Some(4)).unwrap_err();
        assert!(err.is_communication());
    }

    #[test]
    fn empty_lines_and_terminators() {
        let dev = MemoryDevice::new();
        let mut backend = serial(&dev, &BackendOptions::new().term_read(vec!["\n", "\r\n"]));

        dev.push(b"\r\n\nabc\r\n\n");
        assert_eq!(backend.readline().unwrap().as_bytes(), b"abc");
        let line = backend
            .readline_with(&ReadlineOptions::default().keep_empty())
            .unwrap();
        assert!(line.is_empty());

        dev.push(b"raw\r\n");
        let line = backend.readline_with(&ReadlineOptions::raw()).unwrap();
        assert_eq!(line.as_bytes(), b"raw\r\n");
    }

    #[test]
    fn connect_on_operation_keeps_port_closed() {
        let dev = MemoryDevice::new();
        let mut backend = serial(&dev, &BackendOptions::new().connect_on_operation(true));
        assert_eq!(dev.opens(), 0);

        backend.write(b"*RST").unwrap();
        assert_eq!((dev.opens(), dev.closes()), (1, 1));

        dev.reply_to(b"*IDN?\r\n", b"ACME,42\n");
        {
            let mut op = backend.single_op().unwrap();
            let reply = op.ask(b"*IDN?", None, false).unwrap();
            assert_eq!(reply.as_bytes(), b"ACME,42");
        }
        assert_eq!((dev.opens(), dev.closes()), (2, 2));
    }

    #[test]
    fn open_retries_then_fails() {
        let dev = MemoryDevice::new();
        dev.fail_next_opens(2);
        let backend = serial(&dev, &BackendOptions::new().open_retry_times(3));
        assert!(backend.is_open());

        let dev = MemoryDevice::new();
        dev.fail_next_opens(3);
        let err = SerialBackend::with_interface(
            Box::new(dev.clone()),
            SerialBackend::default_conn(),
            &BackendOptions::new().open_retry_times(3),
        )
        .unwrap_err();
        assert!(err.is_open_error());
        assert_eq!(dev.opens(), 0);
    }

    #[test]
    fn network_reads_are_strict() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut query = [0u8; 7];
            conn.read_exact(&mut query).unwrap();
            conn.write_all(b"1.25\r\npartial").unwrap();
            thread::sleep(Duration::from_millis(500));
            query
        });

        let params = NetworkBackend::default_conn().with("addr", format!("127.0.0.1:{port}"));
        let opts = BackendOptions::new().timeout(Duration::from_millis(200));
        let mut backend = NetworkBackend::new(params, &opts).unwrap();
        assert_eq!(backend.params().get("port"), Some(&ParamValue::Int(i64::from(port))));

        let reply = backend.ask(b"MEAS?", None, false).unwrap();
        assert_eq!(reply.as_bytes(), b"1.25");
        let err = backend
            .readline_with(&ReadlineOptions::default().partial_on_timeout())
            .unwrap_err();
        assert!(err.is_timeout());

        assert_eq!(&server.join().unwrap(), b"MEAS?\r\n");
    }

    #[test]
    fn malformed_network_address() {
        let params = NetworkBackend::default_conn().with("addr", "10.0.0.1:80:81");
        let err = NetworkBackend::new(params, &BackendOptions::new()).unwrap_err();
        assert!(matches!(err, CommError::Validation(_)));
    }
}
