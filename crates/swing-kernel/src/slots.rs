//! Reference formats.
//!
//! Kernel slots (krefs) look like `ko20`, `kp40`, `kd30`. Vat slots look like
//! `o+4` (exported by the vat) or `o-50` (imported into it).

use std::{fmt, str::FromStr};

use crate::{KernelError, KernelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    Object,
    Promise,
    Device,
}

impl SlotType {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotType::Object => "object",
            SlotType::Promise => "promise",
            SlotType::Device => "device",
        }
    }

    pub(crate) fn vat_char(self) -> char {
        match self {
            SlotType::Object => 'o',
            SlotType::Promise => 'p',
            SlotType::Device => 'd',
        }
    }

    fn kernel_prefix(self) -> &'static str {
        match self {
            SlotType::Object => "ko",
            SlotType::Promise => "kp",
            SlotType::Device => "kd",
        }
    }
}

fn parse_id(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSlot {
    pub slot_type: SlotType,
    pub id: u64,
}

impl KernelSlot {
    pub fn new(slot_type: SlotType, id: u64) -> Self {
        Self { slot_type, id }
    }

    /// Parse and insist on a particular type.
    pub fn parse_as(kref: &str, expected: SlotType) -> KernelResult<Self> {
        let slot: KernelSlot = kref.parse()?;
        if slot.slot_type != expected {
            return Err(KernelError::WrongSlotType {
                slot: kref.to_string(),
                expected: expected.as_str(),
            });
        }
        Ok(slot)
    }
}

impl FromStr for KernelSlot {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::InvalidSlot(s.to_string());
        let slot_type = match s.get(..2) {
            Some("ko") => SlotType::Object,
            Some("kp") => SlotType::Promise,
            Some("kd") => SlotType::Device,
            _ => return Err(invalid()),
        };
        let id = parse_id(&s[2..]).ok_or_else(invalid)?;
        Ok(Self { slot_type, id })
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.slot_type.kernel_prefix(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VatSlot {
    pub slot_type: SlotType,
    pub allocated_by_vat: bool,
    pub id: u64,
}

impl VatSlot {
    pub fn new(slot_type: SlotType, allocated_by_vat: bool, id: u64) -> Self {
        Self {
            slot_type,
            allocated_by_vat,
            id,
        }
    }
}

impl FromStr for VatSlot {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KernelError::InvalidSlot(s.to_string());
        let mut chars = s.chars();
        let slot_type = match chars.next() {
            Some('o') => SlotType::Object,
            Some('p') => SlotType::Promise,
            Some('d') => SlotType::Device,
            _ => return Err(invalid()),
        };
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(invalid()),
        };
        let id = parse_id(chars.as_str()).ok_or_else(invalid)?;
        Ok(Self {
            slot_type,
            allocated_by_vat,
            id,
        })
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        write!(f, "{}{sign}{}", self.slot_type.vat_char(), self.id)
    }
}

fn is_prefixed_id(s: &str, prefix: char) -> bool {
    s.strip_prefix(prefix).and_then(parse_id).is_some()
}

pub fn insist_vat_id(vat_id: &str) -> KernelResult<()> {
    if is_prefixed_id(vat_id, 'v') {
        Ok(())
    } else {
        Err(KernelError::InvalidVatId(vat_id.to_string()))
    }
}

pub fn insist_device_id(device_id: &str) -> KernelResult<()> {
    if is_prefixed_id(device_id, 'd') {
        Ok(())
    } else {
        Err(KernelError::InvalidDeviceId(device_id.to_string()))
    }
}

pub(crate) fn make_vat_id(id: u64) -> String {
    format!("v{id}")
}

pub(crate) fn make_device_id(id: u64) -> String {
    format!("d{id}")
}
