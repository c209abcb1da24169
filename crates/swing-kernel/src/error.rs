use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("store error: {0}")]
    Store(#[from] swing_store::StoreError),
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid kernel config: {0}")]
    InvalidConfig(String),
    #[error("invalid slot '{0}'")]
    InvalidSlot(String),
    #[error("'{slot}' is not a kernel {expected}")]
    WrongSlotType { slot: String, expected: &'static str },
    #[error("invalid vat ID '{0}'")]
    InvalidVatId(String),
    #[error("invalid device ID '{0}'")]
    InvalidDeviceId(String),
    #[error("no vat named '{0}'")]
    UnknownVatName(String),
    #[error("no device named '{0}'")]
    UnknownDeviceName(String),
    #[error("no kernel object, promise or device {0}")]
    UnknownKernelSlot(String),
    #[error("unknown kernel promise {0}")]
    UnknownPromise(String),
    #[error("{kpid} is '{state}', not 'unresolved'")]
    PromiseNotUnresolved { kpid: String, state: &'static str },
    #[error("unknown meter {0}")]
    UnknownMeter(String),
    #[error("meter {0} overflowed")]
    MeterOverflow(String),
    #[error("refCount underflow on {0}")]
    RefCountUnderflow(String),
    #[error("bad refCount for {kref}: reachable {reachable} > recognizable {recognizable}")]
    InvalidRefCount {
        kref: String,
        reachable: u64,
        recognizable: u64,
    },
    #[error("vat {vat_id} has no c-list entry for {slot}")]
    NotInClist { vat_id: String, slot: String },
    #[error("vat {vat_id} referenced unknown import {vat_slot}")]
    UnknownVatSlot { vat_id: String, vat_slot: String },
    #[error("vat {vat_id} may not export device node {vat_slot}")]
    DeviceExport { vat_id: String, vat_slot: String },
    #[error("kernel stats are not initialized")]
    StatsNotInitialized,
    #[error("unknown stat '{0}'")]
    UnknownStat(String),
    #[error("'{0}' is not a gauge")]
    NotAGauge(String),
    #[error("corrupt kernel state: {0}")]
    Corrupt(String),
}
