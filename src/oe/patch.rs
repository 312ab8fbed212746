//! Pure analyse/patch transform for OE attachment JSON.
//!
//! The attachment carries a `NonCommercialProduct` list of schema objects,
//! each mapping a schema name (e.g. `"Voice OE"`) to an `attributes` list of
//! `{name, value, label}` entries. Mandatory attributes vary by service
//! type; attribute names drift in casing and spacing, so matching is
//! alias-based. Patching is strictly SET_IF_EMPTY: a non-empty existing
//! value is never overwritten.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

pub const RESERVED_NUMBER: &str = "ReservedNumber";
pub const RESOURCE_SYSTEM_GROUP_ID: &str = "ResourceSystemGroupID";
pub const NUMBER_STATUS: &str = "NumberStatus";
pub const PIC_EMAIL: &str = "PICEmail";
pub const BILLING_ACCOUNT: &str = "BillingAccount";
pub const ESMS_USER_NAME: &str = "eSMSUserName";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceType {
    #[serde(rename = "Voice")]
    Voice,
    #[serde(rename = "Fibre Service")]
    Fibre,
    #[serde(rename = "eSMS Service")]
    Esms,
    #[serde(rename = "Access Service")]
    Access,
}

impl ServiceType {
    pub fn display(&self) -> &'static str {
        match self {
            ServiceType::Voice => "Voice",
            ServiceType::Fibre => "Fibre Service",
            ServiceType::Esms => "eSMS Service",
            ServiceType::Access => "Access Service",
        }
    }

    /// Substring identifying this type's schema inside the attachment.
    pub fn schema_key(&self) -> &'static str {
        match self {
            ServiceType::Voice => "Voice OE",
            ServiceType::Fibre => "Fibre Service OE",
            ServiceType::Esms => "eSMS OE",
            ServiceType::Access => "Access OE",
        }
    }

    pub fn mandatory_fields(&self) -> &'static [&'static str] {
        match self {
            ServiceType::Voice => &[
                RESERVED_NUMBER,
                RESOURCE_SYSTEM_GROUP_ID,
                NUMBER_STATUS,
                PIC_EMAIL,
            ],
            ServiceType::Fibre => &[BILLING_ACCOUNT],
            ServiceType::Esms => &[RESERVED_NUMBER, ESMS_USER_NAME],
            ServiceType::Access => &[BILLING_ACCOUNT, PIC_EMAIL],
        }
    }

    /// Classify from the product-definition name.
    pub fn from_product_definition(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.contains("voice") {
            Some(ServiceType::Voice)
        } else if name.contains("fibre") {
            Some(ServiceType::Fibre)
        } else if name.contains("esms") || name.contains("e-sms") {
            Some(ServiceType::Esms)
        } else if name.contains("access") {
            Some(ServiceType::Access)
        } else {
            None
        }
    }

    /// Fallback classification: look for a known schema key inside the
    /// attachment itself.
    pub fn from_attachment(content: &Value) -> Option<Self> {
        let products = content.get("NonCommercialProduct")?.as_array()?;
        for candidate in [
            ServiceType::Voice,
            ServiceType::Fibre,
            ServiceType::Esms,
            ServiceType::Access,
        ] {
            let key = candidate.schema_key();
            let found = products.iter().any(|schema_obj| {
                schema_obj
                    .as_object()
                    .map(|map| map.keys().any(|name| name.contains(key)))
                    .unwrap_or(false)
            });
            if found {
                return Some(candidate);
            }
        }
        None
    }
}

/// Lowercase and strip spaces; underscores are kept, matching the alias
/// spellings seen in real attachments.
fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace(' ', "")
}

/// Normalised alias spellings per canonical field.
fn aliases(field: &str) -> &'static [&'static str] {
    match field {
        RESERVED_NUMBER => &["reservednumber", "reserved_number"],
        RESOURCE_SYSTEM_GROUP_ID => &["resourcesystemgroupid"],
        NUMBER_STATUS => &["numberstatus", "number_status"],
        PIC_EMAIL => &["picemail", "pic_email"],
        BILLING_ACCOUNT => &["billingaccount", "billing_account"],
        ESMS_USER_NAME => &["esmsusername", "esms_username"],
        _ => &[],
    }
}

/// Canonical name -> on-disk spelling inside the attachment.
fn disk_name(field: &str) -> &str {
    match field {
        BILLING_ACCOUNT => "Billing Account",
        PIC_EMAIL => "PIC Email",
        ESMS_USER_NAME => "eSMS UserName",
        other => other,
    }
}

fn attribute_value_string(attr: &Value) -> String {
    match attr.get("value") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    }
}

/// Result of scanning an attachment for mandatory fields.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub missing: Vec<&'static str>,
    pub present: BTreeMap<&'static str, String>,
}

/// Scan `NonCommercialProduct` (and only it) for the service type's
/// mandatory fields. A field counts as present when any alias carries a
/// non-empty trimmed string value.
pub fn analyse(content: &Value, service_type: ServiceType) -> Analysis {
    let mut index: BTreeMap<String, String> = BTreeMap::new();
    if let Some(products) = content.get("NonCommercialProduct").and_then(Value::as_array) {
        for schema_obj in products {
            let Some(map) = schema_obj.as_object() else {
                continue;
            };
            for schema_data in map.values() {
                let Some(attrs) = schema_data.get("attributes").and_then(Value::as_array) else {
                    continue;
                };
                for attr in attrs {
                    if let Some(name) = attr.get("name").and_then(Value::as_str) {
                        // A field is present when ANY occurrence of an alias
                        // carries a value, so a non-empty value always wins.
                        let entry = index.entry(normalize(name)).or_default();
                        if entry.trim().is_empty() {
                            *entry = attribute_value_string(attr);
                        }
                    }
                }
            }
        }
    }

    let mut missing = Vec::new();
    let mut present = BTreeMap::new();
    for field in service_type.mandatory_fields() {
        let found = aliases(field).iter().find_map(|alias| {
            index
                .get(*alias)
                .filter(|value| !value.trim().is_empty())
                .cloned()
        });
        match found {
            Some(value) => {
                present.insert(*field, value);
            }
            None => missing.push(*field),
        }
    }
    Analysis { missing, present }
}

/// One field write to apply to the attachment.
#[derive(Debug, Clone, Serialize)]
pub struct PatchInstruction {
    pub field: &'static str,
    pub value: String,
    pub label: String,
}

/// Build patch instructions for the missing fields from the resolved
/// enrichment values. Fields whose source value is unavailable are dropped;
/// the caller decides whether an empty instruction set is an error.
pub fn build_instructions(
    missing: &[&'static str],
    enrichment: &crate::runtime::Enrichment,
) -> Vec<PatchInstruction> {
    let mut instructions = Vec::new();
    for field in missing {
        let instruction = match *field {
            RESOURCE_SYSTEM_GROUP_ID => Some(PatchInstruction {
                field: RESOURCE_SYSTEM_GROUP_ID,
                value: "Migrated".to_string(),
                label: "Migrated".to_string(),
            }),
            NUMBER_STATUS => Some(PatchInstruction {
                field: NUMBER_STATUS,
                value: "Reserved".to_string(),
                label: "Reserved".to_string(),
            }),
            RESERVED_NUMBER => enrichment
                .reserved_number
                .clone()
                .map(|value| PatchInstruction {
                    field: RESERVED_NUMBER,
                    label: value.clone(),
                    value,
                }),
            PIC_EMAIL => enrichment.pic_email.clone().map(|value| PatchInstruction {
                field: PIC_EMAIL,
                label: value.clone(),
                value,
            }),
            ESMS_USER_NAME => enrichment.pic_email.clone().map(|value| PatchInstruction {
                field: ESMS_USER_NAME,
                label: value.clone(),
                value,
            }),
            BILLING_ACCOUNT => {
                enrichment
                    .billing_account_id
                    .clone()
                    .map(|value| PatchInstruction {
                        field: BILLING_ACCOUNT,
                        label: enrichment
                            .billing_account_name
                            .clone()
                            .unwrap_or_else(|| value.clone()),
                        value,
                    })
            }
            _ => None,
        };
        if let Some(instruction) = instruction {
            instructions.push(instruction);
        }
    }
    instructions
}

/// Apply instructions to a deep copy of the attachment under SET_IF_EMPTY
/// semantics. Returns the patched attachment and the canonical names of the
/// fields actually written. When no schema matches the service type the
/// attachment is returned unchanged with an empty patch list.
pub fn apply_patch(
    content: &Value,
    instructions: &[PatchInstruction],
    service_type: ServiceType,
) -> (Value, Vec<String>) {
    let mut patched = content.clone();
    let mut fields_patched = Vec::new();

    let schema_key = service_type.schema_key();
    let mut location: Option<(usize, String)> = None;
    if let Some(products) = patched.get("NonCommercialProduct").and_then(Value::as_array) {
        'search: for (index, schema_obj) in products.iter().enumerate() {
            if let Some(map) = schema_obj.as_object() {
                for key in map.keys() {
                    if key.contains(schema_key) {
                        location = Some((index, key.clone()));
                        break 'search;
                    }
                }
            }
        }
    }
    let Some((index, key)) = location else {
        return (patched, fields_patched);
    };
    let Some(attrs) = patched
        .get_mut("NonCommercialProduct")
        .and_then(Value::as_array_mut)
        .and_then(|products| products.get_mut(index))
        .and_then(|schema_obj| schema_obj.get_mut(&key))
        .and_then(|schema_data| schema_data.get_mut("attributes"))
        .and_then(Value::as_array_mut)
    else {
        return (patched, fields_patched);
    };

    for instruction in instructions {
        let name = disk_name(instruction.field);
        let normalized = normalize(name);
        let existing = attrs.iter_mut().find(|attr| {
            attr.get("name")
                .and_then(Value::as_str)
                .map(|attr_name| normalize(attr_name) == normalized)
                .unwrap_or(false)
        });
        match existing {
            Some(attr) => {
                let current = attribute_value_string(attr);
                if current.trim().is_empty() {
                    attr["value"] = Value::String(instruction.value.clone());
                    attr["label"] = Value::String(instruction.label.clone());
                    fields_patched.push(instruction.field.to_string());
                }
            }
            None => {
                attrs.push(json!({
                    "name": name,
                    "value": instruction.value,
                    "label": instruction.label,
                }));
                fields_patched.push(instruction.field.to_string());
            }
        }
    }

    (patched, fields_patched)
}
