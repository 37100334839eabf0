//! Gen2 request/response over a simulated link

mod common;

#[cfg(test)]
mod tests {
    use super::common::{fast_config, gen2, wait_for_event};
    use fidlink_core::protocol::text::{MessageType, TextMessage, TextProtocol};
    use fidlink_core::protocol::ProtocolError;
    use fidlink_core::session::SessionEvent;
    use fidlink_core::sim::gen2::line;
    use fidlink_core::sim::Gen2Sim;
    use fidlink_core::telemetry::Range;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_readings_and_status_queries() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());

        assert!(analyzer.ping().is_ok());
        assert_eq!(analyzer.read_version().unwrap(), "4.1.0");

        let readings = analyzer.read_readings().unwrap();
        assert!(close(readings.raw_ppm, 10.0));
        assert!(close(readings.pico_amps, 42.0));
        assert!(readings.primary_pump);

        let battery = analyzer.battery_status().unwrap();
        assert!(close(battery.volts, 7.4));
        assert!(close(battery.percent, 82.0));
        assert!(!battery.charging);

        let drive = analyzer.drive_levels().unwrap();
        assert!(close(drive.primary_pump, 45.0));
        assert!(close(drive.secondary_pump, 0.0));

        assert_eq!(link.with_device(|sim| sim.count(MessageType::Rdng)), 1);
    }

    #[test]
    fn test_settings_round_trip() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());

        analyzer.set_range(Range::Max).unwrap();
        analyzer.set_averaging_depth(10).unwrap();
        analyzer.pump(false).unwrap();

        let readings = analyzer.read_readings().unwrap();
        assert_eq!(readings.range, Range::Max);
        assert_eq!(readings.hardware_averaging, 10);
        assert!(!readings.primary_pump);
        assert_eq!(link.with_device(|sim| sim.readings.range), Range::Max);
    }

    #[test]
    fn test_unknown_line_is_reported_and_skipped() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        let events = analyzer.session().events().subscribe();

        link.inject(b"FID2 BOGUS x=1\r\n");
        let event = wait_for_event(&events, Duration::from_secs(1), |e| {
            matches!(e, SessionEvent::RawMessage { .. })
        });
        match event {
            Some(SessionEvent::RawMessage { raw, .. }) => assert!(raw.contains("BOGUS")),
            other => panic!("expected a raw message event, got {other:?}"),
        }

        assert!(analyzer.read_readings().is_ok());
    }

    #[test]
    fn test_discard_run_past_limit_keeps_session_usable() {
        let mut config = fast_config();
        config.text.max_discards = 3;
        let (analyzer, link) = gen2(Gen2Sim::new(), config);
        let events = analyzer.session().events().subscribe();

        for i in 0..7 {
            link.inject(format!("FID2 BOGUS{i} x=1\r\n").as_bytes());
        }
        let mut discarded = 0;
        while wait_for_event(&events, Duration::from_secs(1), |e| {
            matches!(e, SessionEvent::RawMessage { .. })
        })
        .is_some()
        {
            discarded += 1;
            if discarded == 7 {
                break;
            }
        }
        assert_eq!(discarded, 7);

        assert!(analyzer.read_readings().is_ok());
        assert!(analyzer.ping().is_ok());
    }

    #[test]
    fn test_device_error_report() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        link.with_device(|sim| sim.fail_next(MessageType::Calt, 2));

        match analyzer.read_calibration(0) {
            Err(ProtocolError::DeviceReported {
                error_type, code, ..
            }) => {
                assert_eq!(error_type, "CALT");
                assert_eq!(code, 2);
            }
            other => panic!("expected device error, got {other:?}"),
        }
        assert!(analyzer.read_calibration(0).is_ok());
    }

    #[test]
    fn test_shutdown_announcement() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        let events = analyzer.session().events().subscribe();

        link.inject(&line(
            &TextMessage::new(MessageType::Shut).param("reason", "battery"),
        ));
        let event = wait_for_event(&events, Duration::from_secs(1), |e| {
            matches!(e, SessionEvent::DeviceShutdown { .. })
        });
        assert_eq!(
            event,
            Some(SessionEvent::DeviceShutdown {
                reason: "battery".into()
            })
        );
    }

    #[test]
    fn test_calibration_cycle() {
        let (analyzer, _link) = gen2(Gen2Sim::new(), fast_config());

        let result = analyzer.generate_calibration(4, 250.5).unwrap();
        assert_eq!(result.slot.index, 4);
        assert!(result.slot.is_valid);
        assert!(close(result.slot.ppm, 250.5));
        assert!(result.slot.timestamp.is_some());

        let slots = analyzer.calibration_slots().unwrap();
        assert_eq!(slots.len(), 10);
        assert_eq!(slots.iter().filter(|s| s.is_valid).count(), 1);

        analyzer.clear_calibration(4).unwrap();
        assert!(!analyzer.read_calibration(4).unwrap().is_valid);

        let err = analyzer.read_calibration(10).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest(_)));
    }

    #[test]
    fn test_log_retrieval() {
        let mut sim = Gen2Sim::new();
        sim.device_log = (0..100u8).collect();
        let (analyzer, _link) = gen2(sim, fast_config());

        let log = analyzer.retrieve_logs().unwrap();
        assert_eq!(log, (0..100u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_log_without_end_marker_returns_partial() {
        let mut sim = Gen2Sim::new();
        sim.device_log = vec![0xAB; 100];
        sim.omit_log_end = true;
        let (analyzer, _link) = gen2(sim, fast_config());

        let parts = analyzer
            .session()
            .correlator()
            .send_and_wait_multiple(
                TextMessage::new(MessageType::Logr),
                None,
                TextProtocol::is_log_end,
                Duration::from_millis(300),
            )
            .unwrap();
        assert_eq!(parts.len(), 4);
    }

    #[test]
    fn test_bulk_limit() {
        let mut sim = Gen2Sim::new();
        sim.device_log = vec![0x01; 200];
        let (analyzer, _link) = gen2(sim, fast_config());

        let parts = analyzer
            .session()
            .correlator()
            .send_and_wait_multiple(
                TextMessage::new(MessageType::Logr),
                Some(2),
                TextProtocol::is_log_end,
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_empty_log_with_no_reply_times_out() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        link.with_device(|sim| sim.mute(MessageType::Logr));

        let err = analyzer
            .session()
            .correlator()
            .send_and_wait_multiple(
                TextMessage::new(MessageType::Logr),
                None,
                TextProtocol::is_log_end,
                Duration::from_millis(100),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CorrelationTimeout { .. }));
    }
}
