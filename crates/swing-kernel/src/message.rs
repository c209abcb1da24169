use serde::{Deserialize, Serialize};

use crate::config::ReapInterval;

/// Serialized data plus the krefs it references, in slot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<String>,
}

impl CapData {
    pub fn new(body: impl Into<String>, slots: Vec<String>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }
}

/// A method invocation travelling between vats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub methargs: CapData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Option changes a vat can request for itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptionsChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<ReapInterval>,
}

/// One job on the run or acceptance queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunQueueEvent {
    Send {
        target: String,
        msg: Message,
    },
    Notify {
        #[serde(rename = "vatID")]
        vat_id: String,
        kpid: String,
    },
    DropExports {
        #[serde(rename = "vatID")]
        vat_id: String,
        krefs: Vec<String>,
    },
    RetireExports {
        #[serde(rename = "vatID")]
        vat_id: String,
        krefs: Vec<String>,
    },
    RetireImports {
        #[serde(rename = "vatID")]
        vat_id: String,
        krefs: Vec<String>,
    },
    BringOutYourDead {
        #[serde(rename = "vatID")]
        vat_id: String,
    },
    StartVat {
        #[serde(rename = "vatID")]
        vat_id: String,
        vat_parameters: CapData,
    },
    UpgradeVat {
        #[serde(rename = "vatID")]
        vat_id: String,
        #[serde(rename = "upgradeID")]
        upgrade_id: String,
        #[serde(rename = "bundleID")]
        bundle_id: String,
        vat_parameters: CapData,
        upgrade_message: String,
    },
    ChangeVatOptions {
        #[serde(rename = "vatID")]
        vat_id: String,
        options: VatOptionsChange,
    },
}
