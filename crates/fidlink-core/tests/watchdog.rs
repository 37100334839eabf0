//! Link watchdog against a silent or chatty simulated device

mod common;

#[cfg(test)]
mod tests {
    use super::common::{eventually, fast_config, gen1, gen2, wait_for_event};
    use fidlink_core::config::SessionConfig;
    use fidlink_core::protocol::binary::Command;
    use fidlink_core::protocol::text::MessageType;
    use fidlink_core::protocol::ProtocolError;
    use fidlink_core::session::SessionEvent;
    use fidlink_core::sim::{Gen1Sim, Gen2Sim};
    use std::time::Duration;

    fn watched(quiet_ms: u64, ping_ms: u64) -> SessionConfig {
        let mut config = fast_config();
        config.watchdog.enabled = true;
        config.watchdog.check_interval_ms = 50;
        config.watchdog.polling_interval_ms = 100;
        config.watchdog.stale_grace_ms = 100;
        config.watchdog.quiet_period_ms = quiet_ms;
        config.watchdog.ping_interval_ms = ping_ms;
        config
    }

    #[test]
    fn test_silent_link_is_declared_dead() {
        let (analyzer, _link) = gen1(Gen1Sim::new(), watched(300, 0));
        let events = analyzer.session().events().subscribe();

        let event = wait_for_event(&events, Duration::from_secs(3), |e| {
            matches!(e, SessionEvent::ReconnectNeeded { .. })
        });
        assert!(event.is_some());
        assert!(analyzer.session().reconnect_needed().is_some());

        match analyzer.read_status() {
            Err(ProtocolError::ReconnectNeeded(_)) => {}
            other => panic!("expected reconnect needed, got {other:?}"),
        }
    }

    #[test]
    fn test_pings_keep_link_alive() {
        let (analyzer, link) = gen1(Gen1Sim::new(), watched(300, 50));

        std::thread::sleep(Duration::from_millis(800));
        assert_eq!(analyzer.session().reconnect_needed(), None);
        assert!(link.with_device(|sim| sim.count(Command::AreYouThere)) >= 5);
        assert!(analyzer.read_status().is_ok());
    }

    #[test]
    fn test_missing_parses_are_reported_stale() {
        let (analyzer, _link) = gen2(Gen2Sim::new(), watched(5_000, 0));
        let events = analyzer.session().events().subscribe();

        let stale = wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::LinkStale { .. })
        });
        assert!(stale.is_some());
        // Stale is a warning only
        assert_eq!(analyzer.session().reconnect_needed(), None);
        assert!(analyzer.ping().is_ok());
    }

    #[test]
    fn test_text_pings_use_ping_message() {
        let (analyzer, link) = gen2(Gen2Sim::new(), watched(300, 50));
        assert!(eventually(Duration::from_secs(1), || {
            link.with_device(|sim| sim.count(MessageType::Ping)) >= 3
        }));
        assert_eq!(analyzer.session().reconnect_needed(), None);
    }
}
