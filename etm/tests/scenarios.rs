use etm::{ChangeKind, CpuState, Decoder, DecoderOptions, Protocol, TraceConsumer, Verbosity};

#[derive(Default)]
struct Capture {
    messages: Vec<CpuState>,
    reports: Vec<String>,
}

impl TraceConsumer for Capture {
    fn on_message(&mut self, cpu: &CpuState) {
        self.messages.push(cpu.clone());
    }

    fn on_report(&mut self, _verbosity: Verbosity, message: std::fmt::Arguments<'_>) {
        self.reports.push(message.to_string());
    }
}

fn async_prefix() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x80]
}

fn isync_packet(info: u8, addr: u32) -> Vec<u8> {
    let mut bytes = vec![0b0000_1000, info];
    bytes.extend_from_slice(&addr.to_le_bytes());
    bytes
}

#[test]
fn async_resync_then_isync_establishes_arm_address() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    assert!(!decoder.is_synced());

    let mut stream = async_prefix();
    stream.extend(isync_packet(0x00, 0x0800_0004));
    decoder.pump(&stream, &mut capture);

    assert!(decoder.is_synced());
    assert_eq!(capture.messages.len(), 1);
    assert_eq!(decoder.cpu_state().addr(), 0x0800_0004);
    assert_eq!(decoder.cpu_state().addr_mode(), etm::AddrMode::Arm);
    assert!(decoder.take_change(ChangeKind::Address));
    // A second poll finds the bit already cleared.
    assert!(!decoder.take_change(ChangeKind::Address));
}

#[test]
fn no_message_before_first_isync() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    let mut stream = async_prefix();
    // A Trigger packet before any I-Sync: counted internally, but must
    // never reach the consumer.
    stream.push(0b0000_1100);
    decoder.pump(&stream, &mut capture);

    assert!(decoder.is_synced());
    assert!(capture.messages.is_empty());
}

#[test]
fn trigger_packet_after_isync_emits_immediately() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    let mut stream = async_prefix();
    stream.extend(isync_packet(0x00, 0x0800_0000));
    stream.push(0b0000_1100);
    decoder.pump(&stream, &mut capture);

    assert_eq!(capture.messages.len(), 2);
    assert!(decoder.take_change(ChangeKind::Trigger));
}

#[test]
fn thumb_branch_address_updates_low_bits_only() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    let mut stream = async_prefix();
    // Bit 0 of the I-Sync address set => THUMB mode.
    stream.extend(isync_packet(0x00, 0x0800_0005));
    // Branch-address byte0 (bit0 set), single-byte (bit7 clear, no
    // continuation): carries 6 bits, 0b010101 here.
    stream.push(0b0010_1011);
    decoder.pump(&stream, &mut capture);

    assert_eq!(capture.messages.len(), 2);
    assert_eq!(decoder.cpu_state().addr_mode(), etm::AddrMode::Thumb);
    assert_eq!(decoder.cpu_state().addr(), 0x0800_002A);
}

#[test]
fn pheader_format1_three_executed_one_not() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    let mut stream = async_prefix();
    stream.extend(isync_packet(0x00, 0x0800_0000));
    // Format 1, non-cycle-accurate: eatoms=3, natoms=1.
    stream.push(0b1100_1100);
    decoder.pump(&stream, &mut capture);

    assert_eq!(decoder.cpu_state().eatoms(), 3);
    assert_eq!(decoder.cpu_state().natoms(), 1);
    assert_eq!(decoder.cpu_state().disposition(), 0b111);
    assert_eq!(decoder.cpu_state().inst_count(), 4);
    assert!(decoder.take_change(ChangeKind::ENAtoms));
}

#[test]
fn unrecognised_pheader_is_reported_not_fatal() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    let mut stream = async_prefix();
    stream.extend(isync_packet(0x00, 0x0800_0000));
    stream.push(0b1100_0010); // matches neither Format 1 nor Format 2.
    stream.push(0b0000_1100); // Trigger, to prove the decoder kept going.
    decoder.pump(&stream, &mut capture);

    assert!(!capture.reports.is_empty());
    assert!(decoder.take_change(ChangeKind::Trigger));
}

#[test]
fn mtb_pair_sequence_commits_on_second_pair() {
    let mut decoder = Decoder::new(DecoderOptions {
        protocol: Protocol::Mtb,
        ..DecoderOptions::default()
    });
    let mut capture = Capture::default();

    let mut stream = Vec::new();
    stream.extend_from_slice(&0x1000u32.to_le_bytes());
    stream.extend_from_slice(&0x2000u32.to_le_bytes());
    stream.extend_from_slice(&0x3000u32.to_le_bytes());
    stream.extend_from_slice(&0x4001u32.to_le_bytes());

    decoder.pump(&stream, &mut capture);

    assert_eq!(capture.messages.len(), 1);
    assert_eq!(decoder.cpu_state().addr(), 0x2000);
    assert_eq!(decoder.cpu_state().to_addr(), 0x3000);
    assert_eq!(decoder.cpu_state().next_addr(), 0x4000);
}

#[test]
fn force_sync_false_drops_state_and_requires_fresh_async() {
    let mut decoder = Decoder::new(DecoderOptions::default());
    let mut capture = Capture::default();

    let mut stream = async_prefix();
    stream.extend(isync_packet(0x00, 0x0800_0000));
    decoder.pump(&stream, &mut capture);
    assert!(decoder.is_synced());

    decoder.force_sync(false);
    assert!(!decoder.is_synced());

    // A lone Trigger byte with no fresh A-Sync must not be interpreted as
    // anything: the decoder is back to counting zero bytes.
    decoder.pump(&[0b0000_1100], &mut capture);
    assert!(!decoder.is_synced());
}
