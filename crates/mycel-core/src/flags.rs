//! Packet flag byte.
//!
//! Layout (bit 7 = MSB):
//!   bit 7    error        — packet is travelling back toward its origin
//!   bit 6    throttle     — congestion signal
//!   bits 5-3 control      — mutually exclusive 3-bit enum (see Control)
//!   bits 2-1 reserved, must be zero
//!   bit 0    mode         — routing metric select (0 = dTree, 1 = dCPL)

const ERROR: u8 = 0b1000_0000;
const THROTTLE: u8 = 0b0100_0000;
const CONTROL_MASK: u8 = 0b0011_1000;
const RESERVED1: u8 = 0b0000_0100;
const RESERVED2: u8 = 0b0000_0010;
const MODE: u8 = 0b0000_0001;

/// The mutually exclusive control channel carried in bits 5-3.
/// Setting one value clears whatever was set before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    None = 0b000,
    /// Sender requests an acknowledgement for this packet.
    Ask = 0b001,
    /// Acknowledgement of a previously received packet.
    Ack = 0b010,
    /// Request retransmission of a packet or fragment.
    Rtx = 0b011,
    /// "Request next slot" — modem-wake rendezvous probe.
    Rns = 0b100,
    /// "Next is available" — reply to an RNS.
    Nia = 0b101,
    /// Reserved encodings for future control types.
    Enc6 = 0b110,
    Enc7 = 0b111,
}

impl From<u8> for Control {
    fn from(bits: u8) -> Self {
        match bits & 0b111 {
            0b001 => Control::Ask,
            0b010 => Control::Ack,
            0b011 => Control::Rtx,
            0b100 => Control::Rns,
            0b101 => Control::Nia,
            0b110 => Control::Enc6,
            0b111 => Control::Enc7,
            _ => Control::None,
        }
    }
}

/// One-byte packet flag field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub fn new(state: u8) -> Self {
        Flags(state)
    }

    pub fn error(&self) -> bool {
        self.0 & ERROR != 0
    }

    pub fn set_error(&mut self, val: bool) {
        if val {
            self.0 |= ERROR;
        } else {
            self.0 &= !ERROR;
        }
    }

    pub fn throttle(&self) -> bool {
        self.0 & THROTTLE != 0
    }

    pub fn set_throttle(&mut self, val: bool) {
        if val {
            self.0 |= THROTTLE;
        } else {
            self.0 &= !THROTTLE;
        }
    }

    pub fn control(&self) -> Control {
        Control::from((self.0 & CONTROL_MASK) >> 3)
    }

    /// Overwrites the control channel; any prior value is cleared.
    pub fn set_control(&mut self, c: Control) {
        self.0 = (self.0 & !CONTROL_MASK) | ((c as u8) << 3);
    }

    pub fn ask(&self) -> bool {
        self.control() == Control::Ask
    }

    pub fn ack(&self) -> bool {
        self.control() == Control::Ack
    }

    pub fn rtx(&self) -> bool {
        self.control() == Control::Rtx
    }

    pub fn rns(&self) -> bool {
        self.control() == Control::Rns
    }

    pub fn nia(&self) -> bool {
        self.control() == Control::Nia
    }

    pub fn reserved(&self) -> bool {
        self.0 & (RESERVED1 | RESERVED2) != 0
    }

    /// Routing metric select: false = dTree, true = dCPL.
    pub fn mode(&self) -> bool {
        self.0 & MODE != 0
    }

    pub fn set_mode(&mut self, val: bool) {
        if val {
            self.0 |= MODE;
        } else {
            self.0 &= !MODE;
        }
    }
}

impl From<Flags> for u8 {
    fn from(f: Flags) -> u8 {
        f.0
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Flags(error={}, throttle={}, control={:?}, mode={})",
            self.error(),
            self.throttle(),
            self.control(),
            self.mode()
        )
    }
}
