//! Telemetry poller driving the pipeline against the simulators

mod common;

#[cfg(test)]
mod tests {
    use super::common::{eventually, fast_config, gen1, gen2, wait_for_event};
    use fidlink_core::device::LogTarget;
    use fidlink_core::protocol::binary::Command;
    use fidlink_core::protocol::text::MessageType;
    use fidlink_core::session::SessionEvent;
    use fidlink_core::sim::gen1::idle_status;
    use fidlink_core::sim::gen2::idle_readings;
    use fidlink_core::sim::{Gen1Sim, Gen2Sim};
    use fidlink_core::sink::{FileLogSink, MemoryLogSink};
    use fidlink_core::telemetry::{header_line, Range};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_range_switches_up_and_back_down() {
        let mut sim = Gen1Sim::new();
        let mut hot = idle_status();
        hot.pico_amps_x10 = 70_000;
        hot.raw_ppm_x10 = 45_000;
        sim.push_status(hot);
        let (analyzer, link) = gen1(sim, fast_config());
        let events = analyzer.session().events().subscribe();

        analyzer.start_telemetry(None).unwrap();
        let up = wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::RangeChanged(_))
        });
        assert_eq!(up, Some(SessionEvent::RangeChanged(Range::Max)));
        let down = wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::RangeChanged(_))
        });
        assert_eq!(down, Some(SessionEvent::RangeChanged(Range::Low)));
        analyzer.stop_telemetry();

        assert!(link.with_device(|sim| sim.count(Command::SetRange)) >= 2);
        // High current asked for fast averaging, the idle current for slow
        assert!(link.with_device(|sim| sim.count(Command::SetSamplingParameters)) >= 2);
        assert_eq!(link.with_device(|sim| sim.status.averaging_depth), 50);
    }

    #[test]
    fn test_junk_sample_is_reread() {
        let mut sim = Gen1Sim::new();
        let mut junk = idle_status();
        junk.battery_mv = 20_000;
        sim.push_status(junk);
        let (analyzer, link) = gen1(sim, fast_config());
        let events = analyzer.session().events().subscribe();

        analyzer.start_telemetry(None).unwrap();
        let first = wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::Telemetry(_))
        });
        analyzer.stop_telemetry();

        match first {
            Some(SessionEvent::Telemetry(sample)) => {
                assert!(!sample.junk);
                assert!((sample.raw.battery_volts - 7.4).abs() < 1e-9);
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
        assert!(link.with_device(|sim| sim.count(Command::ReadStatus)) >= 2);
    }

    #[test]
    fn test_flame_out_is_debounced() {
        let mut sim = Gen2Sim::new();
        let mut cold = idle_readings();
        cold.thermocouple_c = 22.0;
        // First sample seeds the state, three cold ones flip it
        sim.push_readings(idle_readings());
        for _ in 0..3 {
            sim.push_readings(cold);
        }
        let (analyzer, _link) = gen2(sim, fast_config());
        let events = analyzer.session().events().subscribe();

        analyzer.start_telemetry(None).unwrap();
        let out = wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::IgnitionChanged { .. })
        });
        assert_eq!(out, Some(SessionEvent::IgnitionChanged { ignited: false }));
        let back = wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::IgnitionChanged { .. })
        });
        assert_eq!(back, Some(SessionEvent::IgnitionChanged { ignited: true }));
        analyzer.stop_telemetry();
    }

    #[test]
    fn test_log_lines_reach_memory_sink() {
        let (analyzer, _link) = gen2(Gen2Sim::new().with_noise(7), fast_config());
        let events = analyzer.session().events().subscribe();
        let sink = MemoryLogSink::new();

        analyzer
            .start_telemetry(Some(LogTarget {
                sink: Box::new(sink.clone()),
                name: "run-1.csv".into(),
            }))
            .unwrap();
        let mut seen = 0;
        while seen < 7 {
            if wait_for_event(&events, Duration::from_secs(2), |e| {
                matches!(e, SessionEvent::Telemetry(_))
            })
            .is_none()
            {
                break;
            }
            seen += 1;
        }
        analyzer.stop_telemetry();
        assert_eq!(seen, 7);

        let lines = sink.lines("run-1.csv");
        assert_eq!(lines[0], header_line());
        // Everything buffered is flushed on stop
        assert!(lines.len() > seen);
        let columns = header_line().split(',').count();
        assert!(lines[1..].iter().all(|l| l.split(',').count() == columns));
    }

    #[test]
    fn test_file_sink_header_written_once() {
        let dir = TempDir::new().unwrap();
        let (analyzer, _link) = gen1(Gen1Sim::new(), fast_config());

        for _ in 0..2 {
            let events = analyzer.session().events().subscribe();
            analyzer
                .start_telemetry(Some(LogTarget {
                    sink: Box::new(FileLogSink::new(dir.path()).unwrap()),
                    name: "session.csv".into(),
                }))
                .unwrap();
            assert!(wait_for_event(&events, Duration::from_secs(2), |e| {
                matches!(e, SessionEvent::Telemetry(_))
            })
            .is_some());
            analyzer.stop_telemetry();
        }

        let text = std::fs::read_to_string(dir.path().join("session.csv")).unwrap();
        let headers = text.lines().filter(|l| *l == header_line()).count();
        assert_eq!(headers, 1);
        assert!(text.lines().count() >= 3);
    }

    #[test]
    fn test_gen1_pushed_status_feeds_pipeline() {
        let mut config = fast_config();
        config.telemetry.periodic_reporting = true;
        config.telemetry.polling_interval_ms = 100;
        let (analyzer, link) = gen1(Gen1Sim::new(), config);
        let events = analyzer.session().events().subscribe();

        analyzer.start_telemetry(None).unwrap();
        assert_eq!(analyzer.periodic_reporting(), Some(Duration::from_millis(100)));
        for _ in 0..3 {
            let sample = wait_for_event(&events, Duration::from_secs(2), |e| {
                matches!(e, SessionEvent::Telemetry(_))
            });
            assert!(sample.is_some());
        }
        analyzer.stop_telemetry();

        // Every sample came from the device unasked
        assert_eq!(link.with_device(|sim| sim.count(Command::ReadStatus)), 0);
        assert_eq!(analyzer.periodic_reporting(), None);
        assert_eq!(link.with_device(|sim| sim.count(Command::SetPeriodicReporting)), 2);
    }

    #[test]
    fn test_gen2_pushed_readings_feed_pipeline() {
        let mut config = fast_config();
        config.telemetry.periodic_reporting = true;
        config.telemetry.polling_interval_ms = 100;
        let (analyzer, link) = gen2(Gen2Sim::new(), config);
        let events = analyzer.session().events().subscribe();

        analyzer.start_telemetry(None).unwrap();
        for _ in 0..3 {
            match wait_for_event(&events, Duration::from_secs(2), |e| {
                matches!(e, SessionEvent::Telemetry(_))
            }) {
                Some(SessionEvent::Telemetry(sample)) => assert!(sample.ignited),
                other => panic!("expected telemetry, got {other:?}"),
            }
        }
        analyzer.stop_telemetry();

        assert_eq!(link.with_device(|sim| sim.count(MessageType::Rdng)), 0);
        assert_eq!(analyzer.periodic_reporting(), None);
    }

    #[test]
    fn test_calibration_while_polling() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        let events = analyzer.session().events().subscribe();
        analyzer.start_telemetry(None).unwrap();
        assert!(wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::Telemetry(_))
        })
        .is_some());

        // The device takes a while, so samples arrive during the capture
        link.with_device(|sim| sim.delay_next(MessageType::Calg, Duration::from_millis(400)));
        let result = analyzer.generate_calibration(1, 100.0).unwrap();
        assert!(result.slot.is_valid);
        let observed = result.observed_ppm.expect("samples captured during calibration");
        assert!((observed - 10.0).abs() < 1.0, "observed {observed}");

        // Polling carries on after the calibration
        let before = link.with_device(|sim| sim.count(MessageType::Rdng));
        assert!(eventually(Duration::from_secs(2), || {
            link.with_device(|sim| sim.count(MessageType::Rdng)) > before
        }));
        analyzer.stop_telemetry();
        assert!(!analyzer.telemetry_running());
    }
}
