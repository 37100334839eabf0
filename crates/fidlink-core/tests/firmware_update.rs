//! Firmware block transfer through the simulated bootloader

mod common;

#[cfg(test)]
mod tests {
    use super::common::{fast_config, gen1, gen2, wait_for_event};
    use fidlink_core::protocol::binary::Command;
    use fidlink_core::protocol::text::MessageType;
    use fidlink_core::protocol::ProtocolError;
    use fidlink_core::session::SessionEvent;
    use fidlink_core::sim::{Gen1Sim, Gen2Sim, SIM_PASSWORD};
    use fidlink_core::transfer::firmware::{pad_image, BLOCK_SIZE};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_gen1_update_with_restart() {
        let (analyzer, link) = gen1(Gen1Sim::new(), fast_config());
        let events = analyzer.session().events().subscribe();
        link.with_device(|sim| sim.reject_block_once(1));

        let firmware = image(10_000);
        let report = analyzer.update_firmware(&firmware, SIM_PASSWORD).unwrap();
        assert_eq!(report.blocks, 3);
        assert_eq!(report.restarts, 1);

        let installed = link.with_device(|sim| sim.installed_image.clone()).unwrap();
        assert_eq!(installed.len(), 3 * BLOCK_SIZE);
        assert_eq!(installed, pad_image(&firmware));
        assert!(!link.with_device(|sim| sim.in_bootloader()));

        let done = wait_for_event(&events, Duration::from_secs(1), |e| *e == SessionEvent::FirmwareDone);
        assert!(done.is_some());

        // Framed traffic works again once the bootloader hands back
        assert!(analyzer.ping().is_ok());
    }

    #[test]
    fn test_gen1_wrong_password() {
        let (analyzer, link) = gen1(Gen1Sim::new(), fast_config());

        let err = analyzer.update_firmware(&image(100), 0xDEAD_BEEF).unwrap_err();
        assert!(matches!(err, ProtocolError::CorrelationTimeout { .. }));
        assert!(link.with_device(|sim| sim.installed_image.is_none()));
        assert!(analyzer.ping().is_ok());
    }

    #[test]
    fn test_gen1_reporting_restored_after_update() {
        let (analyzer, link) = gen1(Gen1Sim::new(), fast_config());
        let period = Duration::from_millis(200);
        analyzer.set_periodic_reporting(true, period).unwrap();

        analyzer.update_firmware(&image(100), SIM_PASSWORD).unwrap();
        assert_eq!(analyzer.periodic_reporting(), Some(period));
        // on, off for the update, on again
        assert_eq!(link.with_device(|sim| sim.count(Command::SetPeriodicReporting)), 3);

        // The device is pushing status frames again
        let pushed = analyzer.session().correlator().wait_for(
            Command::ReadStatus.id(),
            Instant::now(),
            Duration::from_secs(1),
        );
        assert!(pushed.is_ok());
        assert_eq!(link.with_device(|sim| sim.count(Command::ReadStatus)), 0);
    }

    #[test]
    fn test_gen2_reporting_restored_after_failed_update() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        let period = Duration::from_millis(200);
        analyzer.set_periodic_reporting(true, period).unwrap();

        assert!(analyzer.update_firmware(&image(100), 0xDEAD_BEEF).is_err());
        assert_eq!(analyzer.periodic_reporting(), Some(period));
        assert_eq!(link.with_device(|sim| sim.count(MessageType::Prdc)), 3);
    }

    #[test]
    fn test_empty_image_is_refused() {
        let (analyzer, _link) = gen1(Gen1Sim::new(), fast_config());
        let err = analyzer.update_firmware(&[], SIM_PASSWORD).unwrap_err();
        assert!(matches!(err, ProtocolError::FirmwareUpdate(_)));
    }

    #[test]
    fn test_gen2_update_pauses_telemetry() {
        let (analyzer, link) = gen2(Gen2Sim::new(), fast_config());
        let events = analyzer.session().events().subscribe();
        analyzer.start_telemetry(None).unwrap();
        assert!(wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::Telemetry(_))
        })
        .is_some());

        link.with_device(|sim| sim.reject_block_once(0));
        let firmware = image(BLOCK_SIZE * 2);
        let report = analyzer.update_firmware(&firmware, SIM_PASSWORD).unwrap();
        assert_eq!(report.blocks, 2);
        assert_eq!(report.restarts, 1);
        assert_eq!(link.with_device(|sim| sim.installed_image.clone()), Some(firmware));

        // Telemetry picks up where it left off
        assert!(analyzer.telemetry_running());
        assert!(wait_for_event(&events, Duration::from_secs(2), |e| {
            matches!(e, SessionEvent::Telemetry(_))
        })
        .is_some());
        analyzer.stop_telemetry();
    }

    #[test]
    fn test_gen2_progress_reaches_full() {
        let (analyzer, _link) = gen2(Gen2Sim::new(), fast_config());
        let events = analyzer.session().events().subscribe();

        analyzer.update_firmware(&image(5_000), SIM_PASSWORD).unwrap();

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::FirmwareProgress(p) = event {
                progress.push(p);
            }
        }
        assert_eq!(progress, vec![0, 50, 100]);
    }
}
