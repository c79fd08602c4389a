//! Open-protocol scenarios: attach, heal-on-corrupt, concurrent opens

#[cfg(test)]
mod tests {
    use shmport::{
        BufferDescriptor, Domain, OpenMode, PortConfig, SegmentId, SharedSegment,
    };
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn unique_domain(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "{}{}{}",
            tag,
            std::process::id() % 100_000,
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn open_domain(tag: &str) -> (Domain, String) {
        let name = unique_domain(tag);
        let domain = Domain::new(&name, Box::new(|_, _| {})).unwrap();
        (domain, name)
    }

    #[test]
    fn test_corrupt_segment_recovery_end_to_end() {
        let (domain, domain_name) = open_domain("o1");
        let segment_name = format!("{}_port1", domain_name);

        // Plant a segment that carries no port node at all.
        drop(SharedSegment::create(&segment_name, 2048).unwrap());
        assert!(SharedSegment::exists(&segment_name));

        let config = PortConfig::new(1)
            .with_max_buffer_descriptors(4)
            .with_healthy_check_timeout_ms(1000)
            .with_open_mode(OpenMode::ReadShared);
        let port = domain.open_port(&config).unwrap();
        assert!(port.is_port_ok());

        // The recreated port is fully functional.
        let mut listener = port.create_listener().unwrap();
        let payload = BufferDescriptor::new(SegmentId::random(), 11);
        assert!(port.try_push(&payload).unwrap().pushed);
        let is_closed = AtomicBool::new(false);
        port.wait_pop(&listener, &is_closed).unwrap();
        assert_eq!(listener.head(), Some(payload));
        port.pop(&mut listener).unwrap();
    }

    #[test]
    fn test_attach_succeeds_while_listener_waits() {
        let (domain, _) = open_domain("o2");
        let config = PortConfig::new(2)
            .with_max_buffer_descriptors(4)
            .with_healthy_check_timeout_ms(900)
            .with_open_mode(OpenMode::ReadShared);

        let reader = Arc::new(domain.open_port(&config.clone()).unwrap());
        let listener = reader.create_listener().unwrap();
        let is_closed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let reader = Arc::clone(&reader);
            let is_closed = Arc::clone(&is_closed);
            thread::spawn(move || {
                reader.wait_pop(&listener, &is_closed).map(|_| listener)
            })
        };
        thread::sleep(Duration::from_millis(100));

        // The attach health check must observe the waiting listener's
        // heartbeat and pass.
        let writer = domain
            .open_port(&config.with_open_mode(OpenMode::Write))
            .unwrap();
        let payload = BufferDescriptor::new(SegmentId::random(), 5);
        assert!(writer.try_push(&payload).unwrap().pushed);

        let listener = waiter.join().unwrap().unwrap();
        assert_eq!(listener.head(), Some(payload));
    }

    #[test]
    fn test_concurrent_opens_converge_on_one_port() {
        let (domain, domain_name) = open_domain("o3");
        let domain = Arc::new(domain);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let domain = Arc::clone(&domain);
            handles.push(thread::spawn(move || {
                let config = PortConfig::new(3)
                    .with_max_buffer_descriptors(8)
                    .with_healthy_check_timeout_ms(3000)
                    .with_open_mode(OpenMode::Write);
                domain.open_port(&config).unwrap()
            }));
        }

        let ports: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        // Everyone attached to the same node.
        let uuid = ports[0].uuid();
        assert!(ports.iter().all(|port| port.uuid() == uuid));
        assert_eq!(ports[0].stats().unwrap().ref_count, 4);

        drop(ports);
        assert!(!SharedSegment::exists(&format!("{}_port3", domain_name)));
    }

    #[test]
    fn test_wait_pop_heartbeat_is_bounded_by_port_wait_timeout() {
        let (domain, _) = open_domain("o4");
        let config = PortConfig::new(4)
            .with_max_buffer_descriptors(4)
            .with_healthy_check_timeout_ms(300)
            .with_open_mode(OpenMode::ReadShared);

        let port = Arc::new(domain.open_port(&config).unwrap());
        let listener = port.create_listener().unwrap();
        let is_closed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let port = Arc::clone(&port);
            let is_closed = Arc::clone(&is_closed);
            thread::spawn(move || port.wait_pop(&listener, &is_closed))
        };

        // Let several internal wait timeouts elapse, then close; the
        // waiter must come back within roughly one more timeout.
        thread::sleep(Duration::from_millis(350));
        port.close_listener(&is_closed).unwrap();
        let started = std::time::Instant::now();
        waiter.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
