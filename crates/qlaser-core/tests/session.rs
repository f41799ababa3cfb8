use pretty_assertions::assert_eq;
use qlaser_core::config::SessionConfig;
use qlaser_core::protocol::{
    ChannelSelection, FixedSlot, LinkDescriptor, ProtocolError, ProtocolProfile, PulseConfig, Session,
    SessionState, SlotSource, Strictness, WaveId,
};
use qlaser_core::report::{EventKind, MemorySink, Severity};
use qlaser_core::sim::SimulatedInstrument;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn new_session(profile: ProtocolProfile) -> (Session, Arc<MemorySink>) {
    init_tracing();
    let sink = Arc::new(MemorySink::new());
    let config = SessionConfig::new(LinkDescriptor::new("sim"), profile);
    let session = Session::with_sink(config, sink.clone());
    (session, sink)
}

fn connected(profile: ProtocolProfile) -> (SimulatedInstrument, Session, Arc<MemorySink>) {
    let sim = SimulatedInstrument::new(profile.clone());
    let (mut session, sink) = new_session(profile);
    session.connect(&sim).unwrap();
    sim.clear_sent();
    sink.clear();
    (sim, session, sink)
}

#[test]
fn test_connect_turns_echo_off_and_checks_version() {
    let sim = SimulatedInstrument::new(ProtocolProfile::unified());
    let (mut session, _sink) = new_session(ProtocolProfile::unified());
    session.connect(&sim).unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.version().unwrap_or_default().contains("QLASER"));
    assert!(!sim.echo_enabled());
    assert_eq!(sim.sent(), b"0eV".to_vec());
}

#[test]
fn test_silent_port_is_no_device() {
    let sim = SimulatedInstrument::new(ProtocolProfile::unified());
    sim.set_banner(&[]);
    let (mut session, _sink) = new_session(ProtocolProfile::unified());

    assert!(matches!(session.connect(&sim), Err(ProtocolError::NoDevice)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_stray_carriage_return_is_no_device() {
    let sim = SimulatedInstrument::new(ProtocolProfile::unified());
    sim.set_banner(&["\r"]);
    let (mut session, _sink) = new_session(ProtocolProfile::unified());

    assert!(matches!(session.connect(&sim), Err(ProtocolError::NoDevice)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[test]
fn test_version_mismatch_is_terminal() {
    let sim = SimulatedInstrument::new(ProtocolProfile::unified());
    sim.set_banner(&["QLASER", "DAC TEST BUILD"]);
    let (mut session, _sink) = new_session(ProtocolProfile::unified());

    assert!(matches!(
        session.connect(&sim),
        Err(ProtocolError::VersionMismatch { .. })
    ));
    assert_eq!(session.state(), SessionState::VersionMismatch);
    assert!(matches!(session.reset(), Err(ProtocolError::VersionMismatch { .. })));
    assert!(matches!(
        session.connect(&sim),
        Err(ProtocolError::VersionMismatch { .. })
    ));
    assert_eq!(sim.open_count(), 1);
}

#[test]
fn test_tokens_may_span_lines() {
    let sim = SimulatedInstrument::new(ProtocolProfile::unified());
    sim.set_banner(&["QLASER ZCU", "PULSE v3"]);
    let (mut session, _sink) = new_session(ProtocolProfile::unified());
    session.connect(&sim).unwrap();
    assert_eq!(session.version(), Some("QLASER ZCU\nPULSE v3"));
}

#[test]
fn test_connect_twice() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    assert!(matches!(session.connect(&sim), Err(ProtocolError::AlreadyConnected)));
}

#[test]
fn test_odd_start_address_sends_nothing() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    let result = session.write_waveform_table(3, &[1, 2], false);
    assert!(matches!(
        result,
        Err(ProtocolError::AlignmentError { value: 3, .. })
    ));
    assert!(sim.sent().is_empty());
}

#[test]
fn test_invalid_channel_sends_nothing() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    assert!(matches!(
        session.select_channel(ChannelSelection::One(32)),
        Err(ProtocolError::InvalidChannel { channel: 32, limit: 32 })
    ));
    assert!(matches!(
        session.enable_channels(&[1, 40]),
        Err(ProtocolError::InvalidChannel { channel: 40, .. })
    ));
    assert!(sim.sent().is_empty());
    assert_eq!(session.selected_channel(), None);
}

#[test]
fn test_table_past_capacity_sends_nothing() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    assert!(matches!(
        session.write_waveform_table(4094, &[1, 2, 3], false),
        Err(ProtocolError::InvalidAddress { value: 4098, limit: 4096, .. })
    ));
    assert!(sim.sent().is_empty());
}

#[test]
fn test_waveform_round_trip_unified() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    let written = session.write_waveform_table(10, &[1, 2, 3, 4, 5], false).unwrap();
    assert_eq!(written.samples_written, 6);
    assert!(!written.is_lossy());

    assert_eq!(sim.wave_samples(0, 10, 6), vec![1, 2, 3, 4, 5, 0]);
    assert_eq!(session.read_waveform_table(10, 5).unwrap(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_waveform_round_trip_legacy() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::legacy());
    session.write_waveform_table(0, &[100, 200, 300], false).unwrap();

    // first pair: stage hi<<16|lo, commit at address 0
    let mut first = ((200u64 << 16) | 100).to_string().into_bytes();
    first.push(0xDD);
    first.extend_from_slice(b"0");
    first.push(0x9A);
    assert_eq!(sim.sent()[..first.len()].to_vec(), first);

    assert_eq!(session.read_waveform_table(0, 3).unwrap(), vec![100, 200, 300]);
}

#[test]
fn test_broadcast_table_reaches_every_channel() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.write_waveform_table(0, &[9, 8], true).unwrap();
    assert_eq!(session.selected_channel(), Some(ChannelSelection::All));
    assert_eq!(sim.selected(), 99);
    assert_eq!(sim.wave_samples(0, 0, 2), vec![9, 8]);
    assert_eq!(sim.wave_samples(31, 0, 2), vec![9, 8]);
}

#[test]
fn test_lenient_sample_overflow_is_reported_and_truncated() {
    let (sim, mut session, sink) = connected(ProtocolProfile::unified());
    let written = session.write_waveform_table(0, &[70000, 1], false).unwrap();

    assert_eq!(written.violations.len(), 1);
    assert_eq!(written.violations[0].field, "waveform[0].sample[0]");
    assert_eq!(sink.at_least(Severity::Warning).len(), 1);
    assert_eq!(sim.wave_samples(0, 0, 2), vec![70000 & 0xFFFF, 1]);
}

#[test]
fn test_strict_sample_overflow_sends_nothing() {
    let profile = ProtocolProfile::unified();
    let sim = SimulatedInstrument::new(profile.clone());
    let mut config = SessionConfig::new(LinkDescriptor::new("sim"), profile);
    config.strictness = Strictness::Strict;
    let mut session = Session::with_sink(config, Arc::new(MemorySink::new()));
    session.connect(&sim).unwrap();
    sim.clear_sent();

    assert!(matches!(
        session.write_waveform_table(0, &[1, 2, 70000, 3], false),
        Err(ProtocolError::OutOfRange { value: 70000, bound: 65535, .. })
    ));
    assert!(sim.sent().is_empty());
}

#[test]
fn test_auto_allocation_fills_slots_in_order() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.select_channel(ChannelSelection::One(2)).unwrap();

    let configs = [
        PulseConfig::new(10, WaveId::new(0, 64), 0.5, 1.0, 0),
        PulseConfig::new(200, WaveId::new(64, 32), 1.0, 2.0, 12),
        PulseConfig::new(900, WaveId::new(96, 16), 0.25, 1.5, 100),
    ];
    for (expected_slot, config) in configs.iter().enumerate() {
        let write = session.append_pulse_definition(config).unwrap();
        assert_eq!(write.slot, expected_slot as u16);
        assert!(!write.overwrote);
    }

    assert_eq!(session.pulse_definitions().unwrap(), configs.to_vec());
    let all = session.read_pulse_definitions().unwrap();
    assert_eq!(all.len(), 32);
    assert!(all[3..].iter().all(Option::is_none));

    // packed WaveId lands in register 1 of slot 1
    assert_eq!(sim.definition_registers(2, 1)[1], (32 << 16) | 64);
    assert_eq!(sim.definition_registers(0, 0), [0; 4]);
}

#[test]
fn test_full_channel_wraps_to_slot_zero() {
    let (_sim, mut session, sink) = connected(ProtocolProfile::unified());
    session.select_channel(ChannelSelection::One(0)).unwrap();
    for slot in 0..32u16 {
        let config = PulseConfig::new(10 + slot as u32, WaveId::new(0, 2), 1.0, 1.0, 0);
        session.write_pulse_definition(&config, &mut FixedSlot(slot)).unwrap();
    }

    let write = session
        .append_pulse_definition(&PulseConfig::new(50, WaveId::new(0, 2), 1.0, 1.0, 0))
        .unwrap();
    assert_eq!(write.slot, 0);
    assert!(write.overwrote);
    assert!(sink
        .at_least(Severity::Warning)
        .iter()
        .any(|e| e.kind == EventKind::SlotWrapped { slots: 32 }));
}

#[test]
fn test_first_entry_start_time_is_raised() {
    let (sim, mut session, sink) = connected(ProtocolProfile::unified());
    let write = session
        .append_pulse_definition(&PulseConfig::new(0, WaveId::new(0, 4), 1.0, 1.0, 0))
        .unwrap();

    assert_eq!(write.encoded.start_time, 5);
    assert_eq!(sim.definition_registers(0, 0)[0], 5);
    assert_eq!(
        sink.events()
            .into_iter()
            .filter(|e| e.severity == Severity::Info)
            .map(|e| e.kind)
            .collect::<Vec<_>>(),
        vec![EventKind::StartTimeRaised {
            requested: 0,
            minimum: 5
        }]
    );
}

#[test]
fn test_clear_pulse_definitions() {
    let (_sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session
        .append_pulse_definition(&PulseConfig::new(10, WaveId::new(0, 4), 1.0, 1.0, 0))
        .unwrap();
    session.clear_pulse_definitions().unwrap();
    assert!(session.pulse_definitions().unwrap().is_empty());
}

#[test]
fn test_legacy_definitions_use_byte_offsets() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::legacy());
    let config = PulseConfig::new(40, WaveId::new(8, 16), 1.0, 1.0, 3);
    let write = session.write_pulse_definition(&config, &mut FixedSlot(2)).unwrap();

    let addresses: Vec<u32> = write.encoded.writes.iter().map(|w| w.address).collect();
    assert_eq!(addresses, vec![32, 36, 40, 44]);
    assert_eq!(sim.definition_registers(0, 2)[1], (16 << 16) | 8);
    assert_eq!(session.read_slot(2).unwrap(), Some(config));
}

#[test]
fn test_legacy_reset_seeds_every_channel() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::legacy());
    session.reset().unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(sim.reset_count(), 1);
    for channel in [0, 17, 31] {
        let raw = sim.definition_registers(channel, 0);
        assert_eq!(raw[0], 0xFF_FFFF);
        assert_eq!(raw[1], 2 << 16);
    }
}

#[test]
fn test_unified_reset_does_not_seed() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.reset().unwrap();
    assert_eq!(sim.sent(), vec![0x52]);
    assert_eq!(sim.definition_registers(0, 0), [0; 4]);
}

#[test]
fn test_channel_errors_use_reversed_bit_order() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    sim.set_error_line("overrun:0x80000001,underrun=0");

    let report = session.read_channel_errors().unwrap();
    assert_eq!(report.violation_count(), 2);
    assert_eq!(report.channels_for("overrun"), vec![31, 0]);
    assert!(report.channels_for("underrun").is_empty());
}

#[test]
fn test_clean_error_report() {
    let (_sim, mut session, _sink) = connected(ProtocolProfile::unified());
    let report = session.read_channel_errors().unwrap();
    assert!(report.is_clean());
}

#[test]
fn test_device_error_lines_are_reported_and_skipped() {
    let (sim, mut session, sink) = connected(ProtocolProfile::unified());
    sim.inject_line("ERROR: pdefn fifo full");
    assert_eq!(session.read_misc().unwrap(), 0);

    let errors = sink.at_least(Severity::Error);
    assert_eq!(
        errors[0].kind,
        EventKind::DeviceError("ERROR: pdefn fifo full".to_string())
    );
}

#[test]
fn test_unsolicited_output_is_drained_before_reads() {
    let (sim, mut session, sink) = connected(ProtocolProfile::unified());
    session.select_channel(ChannelSelection::One(0)).unwrap();
    session.write_waveform_table(0, &[11, 22], false).unwrap();
    session
        .write_pulse_definition(&PulseConfig::new(40, WaveId::new(0, 2), 1.0, 1.0, 0), &mut FixedSlot(0))
        .unwrap();

    sim.emit_line("chsel: 0x00000000");
    assert_eq!(session.read_waveform_table(0, 2).unwrap(), vec![11, 22]);

    sim.emit_line("12345");
    let definitions = session.pulse_definitions().unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].start_time, 40);

    sim.emit_line("chsel: 0x00000000");
    assert!(session.read_slot(1).unwrap().is_none());

    let output: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::DeviceOutput(line) => Some(line),
            _ => None,
        })
        .collect();
    assert_eq!(output, vec!["chsel: 0x00000000", "12345", "chsel: 0x00000000"]);
}

#[test]
fn test_strided_definitions_with_bulk_firmware() {
    let profile = ProtocolProfile {
        slot_address_stride: 4,
        ..ProtocolProfile::unified()
    };
    let (sim, mut session, _sink) = connected(profile);
    session.select_channel(ChannelSelection::One(2)).unwrap();
    let config = PulseConfig::new(64, WaveId::new(8, 16), 0.5, 2.0, 3);
    session
        .write_pulse_definition(&config, &mut FixedSlot(1))
        .unwrap();

    assert_eq!(sim.definition_registers(2, 1)[0], 64);
    sim.clear_sent();
    assert_eq!(session.read_slot(1).unwrap(), Some(config));
    // one register per frame at 16, 20, 24, 28
    assert_eq!(sim.sent(), vec![b'1', b'6', 0xAA, b'2', b'0', 0xAA, b'2', b'4', 0xAA, b'2', b'8', 0xAA]);
}

#[test]
fn test_enable_and_sequence_length() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.enable_channels(&[0, 31]).unwrap();
    assert_eq!(sim.enabled_mask(), (1 << 31) | 1);

    sim.clear_sent();
    session.set_sequence_length(1000).unwrap();
    assert_eq!(sim.sent(), b"1000sC".to_vec());
    assert_eq!(sim.sequence_length(), 1000);
    assert_eq!(sim.enabled_mask(), (1 << 31) | 1);
}

#[test]
fn test_enable_mask_on_64_channel_firmware() {
    let profile = ProtocolProfile {
        max_channels: 64,
        ..ProtocolProfile::unified()
    };
    let (sim, mut session, _sink) = connected(profile);
    session.enable_channels(&[0, 63]).unwrap();
    assert_eq!(sim.enabled_mask(), (1 << 63) | 1);
}

#[test]
fn test_trigger_byte_per_revision() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.trigger().unwrap();
    assert_eq!(sim.sent(), vec![0x80]);
    assert_eq!(sim.trigger_count(), 1);

    let (sim, mut session, _sink) = connected(ProtocolProfile::legacy());
    session.trigger().unwrap();
    assert_eq!(sim.sent(), b"t".to_vec());
}

#[test]
fn test_dc_channels() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    assert_eq!(session.set_dc_voltage(3, 1.25).unwrap(), 2048);
    assert_eq!(sim.dc_code(3), Some(2048));

    assert!(matches!(
        session.write_dc(16, 0),
        Err(ProtocolError::InvalidChannel { channel: 16, limit: 16 })
    ));
}

#[test]
fn test_misc_register() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::legacy());
    session.write_misc(77).unwrap();
    assert_eq!(sim.misc_value(), 77);

    sim.push_misc_reply("gpo: 0x0000ab12");
    assert_eq!(session.read_misc().unwrap(), 0xAB12);
    assert_eq!(session.read_misc().unwrap(), 77);
}

#[test]
fn test_error_registers() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::legacy());
    sim.push_misc_reply("gpo: 0x000000a5");
    sim.push_misc_reply("gpo: 0x00003c00");

    let regs = session.read_error_registers().unwrap();
    assert_eq!((regs.high, regs.low), (0x3C, 0xA5));
    assert_eq!(
        regs.to_bit_strings(8),
        ("00111100".to_string(), "10100101".to_string())
    );
}

#[test]
fn test_dump_registers() {
    let (_sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.set_sequence_length(64).unwrap();
    let lines = session.dump_registers().unwrap();
    assert_eq!(lines.len(), 3);
    assert!(lines.contains(&"sequence_length: 64".to_string()));
}

#[test]
fn test_transport_failure_disconnects() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    sim.fail_io(true);
    let err = session.trigger().unwrap_err();
    assert!(err.is_transport());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.trigger(), Err(ProtocolError::NotConnected)));
}

#[test]
fn test_reconnect_after_disconnect() {
    let (sim, mut session, _sink) = connected(ProtocolProfile::unified());
    session.disconnect();
    assert_eq!(session.state(), SessionState::Disconnected);
    session.connect(&sim).unwrap();
    assert_eq!(sim.open_count(), 2);
    let (tx, rx) = session.get_counters();
    assert!(tx > 0 && rx > 0);
}
