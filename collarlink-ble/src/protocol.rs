// Collar device frame definitions
// Nordic UART-style framed byte protocol: 3- to 9-byte frames, no checksum.

/// Frame byte constants
pub mod bytes {
    /// Header of command frames and battery-report notifications
    pub const CMD_HEADER: u8 = 0xAA;
    /// Marker byte following the command header
    pub const CMD_MARKER: u8 = 0x07;
    /// Header of the find-beacon frame
    pub const FIND_HEADER: u8 = 0xEE;
    /// Marker byte of the find-beacon frame
    pub const FIND_MARKER: u8 = 0x02;
    /// First byte of the battery-query frame
    pub const BATTERY_HEADER: u8 = 0xDD;
    /// Second byte of the battery-query frame
    pub const BATTERY_MARKER: u8 = 0xAA;
    /// Trailer shared by all outbound frames
    pub const TAIL: u8 = 0xBB;
}

/// Maximum intensity the device accepts for shock/vibrate/sound
pub const LEVEL_MAX: u8 = 100;

/// Offset of the battery percentage in a battery-report notification
const BATTERY_OFFSET: usize = 5;

/// What a frame means to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Shock/vibrate/sound command (subject to the double-send policy)
    Command,
    /// Find-beacon trigger
    Find,
    /// Battery level query
    BatteryQuery,
    /// Bytes that match none of the known shapes (relayed verbatim)
    Other,
}

/// An immutable byte sequence in one of the device's frame shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    kind: FrameKind,
}

impl Frame {
    /// Wrap raw bytes, classifying them by shape.
    ///
    /// Used when relaying frames received over the wire; locally built
    /// frames come from the `encode_*` constructors.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let kind = classify(&bytes);
        Self { bytes, kind }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Whether the radio-loss double-send policy applies to this frame
    pub fn is_repeated(&self) -> bool {
        self.kind == FrameKind::Command
    }
}

fn classify(bytes: &[u8]) -> FrameKind {
    match bytes {
        [bytes::CMD_HEADER, bytes::CMD_MARKER, _, _, _, bytes::TAIL] => FrameKind::Command,
        [bytes::FIND_HEADER, bytes::FIND_MARKER, bytes::TAIL] => FrameKind::Find,
        [bytes::BATTERY_HEADER, bytes::BATTERY_MARKER, bytes::TAIL] => FrameKind::BatteryQuery,
        _ => FrameKind::Other,
    }
}

/// Clamp an intensity into `0..=100`, rounding to the nearest integer.
///
/// NaN coerces to zero.
pub fn clamp_level(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, LEVEL_MAX as f64).round() as u8
}

/// Build a shock/vibrate/sound command frame: `AA 07 <shock> <vibro> <sound> BB`
pub fn encode_command(shock: f64, vibro: f64, sound: f64) -> Frame {
    Frame {
        bytes: vec![
            bytes::CMD_HEADER,
            bytes::CMD_MARKER,
            clamp_level(shock),
            clamp_level(vibro),
            clamp_level(sound),
            bytes::TAIL,
        ],
        kind: FrameKind::Command,
    }
}

/// Build the find-beacon frame: `EE 02 BB`
pub fn encode_find() -> Frame {
    Frame {
        bytes: vec![bytes::FIND_HEADER, bytes::FIND_MARKER, bytes::TAIL],
        kind: FrameKind::Find,
    }
}

/// Build the battery-query frame: `DD AA BB`
pub fn encode_battery_query() -> Frame {
    Frame {
        bytes: vec![bytes::BATTERY_HEADER, bytes::BATTERY_MARKER, bytes::TAIL],
        kind: FrameKind::BatteryQuery,
    }
}

/// Recognize a battery-report notification and extract the level.
///
/// Returns `None` for anything else; an unrecognized notification is not
/// an error.
pub fn parse_notification(bytes: &[u8]) -> Option<u8> {
    if bytes.len() > BATTERY_OFFSET
        && bytes[0] == bytes::CMD_HEADER
        && bytes[1] == bytes::CMD_MARKER
    {
        Some(bytes[BATTERY_OFFSET])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_shape() {
        let frame = encode_command(50.0, 0.0, 0.0);
        assert_eq!(frame.as_bytes(), &[0xAA, 0x07, 0x32, 0x00, 0x00, 0xBB]);
        assert_eq!(frame.kind(), FrameKind::Command);
        assert_eq!(frame.as_bytes().len(), 6);
    }

    #[test]
    fn test_encode_command_clamps_out_of_range() {
        let frame = encode_command(-1.0, 200.0, 50.0);
        assert_eq!(frame.as_bytes(), &[0xAA, 0x07, 0x00, 0x64, 0x32, 0xBB]);
    }

    #[test]
    fn test_encode_command_rounds_to_nearest() {
        let frame = encode_command(3.6, 3.4, 0.0);
        assert_eq!(frame.as_bytes(), &[0xAA, 0x07, 0x04, 0x03, 0x00, 0xBB]);
    }

    #[test]
    fn test_clamp_is_idempotent() {
        for x in [-10.0, 0.0, 3.6, 50.0, 100.0, 250.0, f64::NAN] {
            let once = clamp_level(x);
            assert_eq!(clamp_level(once as f64), once);
        }
    }

    #[test]
    fn test_clamp_nan_is_zero() {
        assert_eq!(clamp_level(f64::NAN), 0);
    }

    #[test]
    fn test_encode_find() {
        assert_eq!(encode_find().as_bytes(), &[0xEE, 0x02, 0xBB]);
        assert_eq!(encode_find().kind(), FrameKind::Find);
    }

    #[test]
    fn test_encode_battery_query() {
        assert_eq!(encode_battery_query().as_bytes(), &[0xDD, 0xAA, 0xBB]);
        assert_eq!(encode_battery_query().kind(), FrameKind::BatteryQuery);
    }

    #[test]
    fn test_parse_notification_battery_report() {
        assert_eq!(parse_notification(&[0xAA, 0x07, 0, 0, 0, 87]), Some(87));
        assert_eq!(parse_notification(&[0xAA, 0x07, 1, 2, 3, 42, 9]), Some(42));
    }

    #[test]
    fn test_parse_notification_rejects_short_or_foreign() {
        // Too short, even with the right header
        assert_eq!(parse_notification(&[0xAA, 0x07, 0, 0, 0]), None);
        // Wrong header
        assert_eq!(parse_notification(&[0xAB, 0x07, 0, 0, 0, 87]), None);
        // Wrong marker
        assert_eq!(parse_notification(&[0xAA, 0x08, 0, 0, 0, 87]), None);
        assert_eq!(parse_notification(&[]), None);
    }

    #[test]
    fn test_classify_round_trips_wire_bytes() {
        let cmd = Frame::from_bytes(encode_command(10.0, 20.0, 30.0).as_bytes().to_vec());
        assert_eq!(cmd.kind(), FrameKind::Command);
        assert!(cmd.is_repeated());

        let find = Frame::from_bytes(vec![0xEE, 0x02, 0xBB]);
        assert_eq!(find.kind(), FrameKind::Find);
        assert!(!find.is_repeated());

        let query = Frame::from_bytes(vec![0xDD, 0xAA, 0xBB]);
        assert_eq!(query.kind(), FrameKind::BatteryQuery);

        let other = Frame::from_bytes(vec![0x01, 0x02]);
        assert_eq!(other.kind(), FrameKind::Other);
        assert!(!other.is_repeated());
    }
}
