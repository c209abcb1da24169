use std::{fmt, str::FromStr};

use swing_store::KvStore;

use crate::{KernelError, KernelKeeper, KernelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterRemaining {
    Unlimited,
    Limited(u128),
}

impl fmt::Display for MeterRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterRemaining::Unlimited => f.write_str("unlimited"),
            MeterRemaining::Limited(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for MeterRemaining {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "unlimited" {
            return Ok(MeterRemaining::Unlimited);
        }
        s.parse()
            .map(MeterRemaining::Limited)
            .map_err(|_| KernelError::Corrupt(format!("bad meter remaining '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meter {
    pub remaining: MeterRemaining,
    pub threshold: u128,
}

fn remaining_key(meter_id: &str) -> String {
    format!("{meter_id}.remaining")
}

fn threshold_key(meter_id: &str) -> String {
    format!("{meter_id}.threshold")
}

impl KernelKeeper {
    pub fn allocate_meter(&self, remaining: MeterRemaining, threshold: u128) -> KernelResult<String> {
        let meter_id = format!("m{}", self.allocate_id("meter.nextID")?);
        self.kv()
            .set(&remaining_key(&meter_id), &remaining.to_string())?;
        self.kv()
            .set(&threshold_key(&meter_id), &threshold.to_string())?;
        Ok(meter_id)
    }

    fn meter_remaining(&self, meter_id: &str) -> KernelResult<MeterRemaining> {
        self.kv()
            .get(&remaining_key(meter_id))?
            .ok_or_else(|| KernelError::UnknownMeter(meter_id.to_string()))?
            .parse()
    }

    fn meter_threshold(&self, meter_id: &str) -> KernelResult<u128> {
        let raw = self
            .kv()
            .get(&threshold_key(meter_id))?
            .ok_or_else(|| KernelError::UnknownMeter(meter_id.to_string()))?;
        raw.parse()
            .map_err(|_| KernelError::Corrupt(format!("bad meter threshold '{raw}'")))
    }

    pub fn get_meter(&self, meter_id: &str) -> KernelResult<Meter> {
        Ok(Meter {
            remaining: self.meter_remaining(meter_id)?,
            threshold: self.meter_threshold(meter_id)?,
        })
    }

    /// Whether `amount` could be spent right now. No side effects.
    pub fn check_meter(&self, meter_id: &str, amount: u128) -> KernelResult<bool> {
        Ok(match self.meter_remaining(meter_id)? {
            MeterRemaining::Unlimited => true,
            MeterRemaining::Limited(remaining) => remaining >= amount,
        })
    }

    /// Spend `spent`, clamping at zero. Returns true only for the deduction
    /// that takes `remaining` from at-or-above the threshold to below it.
    pub fn deduct_meter(&self, meter_id: &str, spent: u128) -> KernelResult<bool> {
        let MeterRemaining::Limited(old) = self.meter_remaining(meter_id)? else {
            return Ok(false);
        };
        let threshold = self.meter_threshold(meter_id)?;
        let remaining = old.saturating_sub(spent);
        let crossed = old >= threshold && remaining < threshold;
        self.kv()
            .set(&remaining_key(meter_id), &remaining.to_string())?;
        if crossed {
            log::debug!("meter {meter_id} fell below threshold {threshold}");
        }
        Ok(crossed)
    }

    pub fn add_meter_remaining(&self, meter_id: &str, delta: u128) -> KernelResult<()> {
        if let MeterRemaining::Limited(old) = self.meter_remaining(meter_id)? {
            let remaining = old
                .checked_add(delta)
                .ok_or_else(|| KernelError::MeterOverflow(meter_id.to_string()))?;
            self.kv()
                .set(&remaining_key(meter_id), &remaining.to_string())?;
        }
        Ok(())
    }

    pub fn set_meter_threshold(&self, meter_id: &str, threshold: u128) -> KernelResult<()> {
        self.meter_remaining(meter_id)?;
        Ok(self
            .kv()
            .set(&threshold_key(meter_id), &threshold.to_string())?)
    }

    pub fn delete_meter(&self, meter_id: &str) -> KernelResult<()> {
        self.kv().delete(&remaining_key(meter_id))?;
        self.kv().delete(&threshold_key(meter_id))?;
        Ok(())
    }
}
