use std::collections::HashMap;

use tracing::warn;

use super::{AttributeReader, ConfigError, ConfigField, FireTypeMethod, MethodConfig};
use crate::model::{Fire, PRESCRIBED_FIRE, RawData, UNKNOWN_FIRE_TYPE, WILDFIRE};

const FIRE_TYPE: ConfigField = ConfigField {
    name: "fireType",
    description: "Fire type for this source",
};

const FIRE_TYPE_FIELD: ConfigField = ConfigField {
    name: "fireTypeField",
    description: "Fire type field for this source",
};

const SOURCE_TYPE_FIELD: ConfigField = ConfigField {
    name: "sourceTypeField",
    description: "Fire type field (WF, Rx, Ag) for this source",
};

const BURN_TYPE_FIELD: ConfigField = ConfigField {
    name: "burnTypeField",
    description: "Burn type field (broadcast, pile) for this source",
};

const FIRE_TYPE_CROSSWALK: ConfigField = ConfigField {
    name: "fireTypeCrosswalk",
    description: "Codes per fire type, first type is the default. Format WF:accident;lightning!RX:broadcast!pile:hand pile",
};

const PILE_BURN: &str = "pile";
const BROADCAST_BURN_CODE: &str = "B";
const MTBS_MISSING_TYPE: &str = "N/A";

pub struct FixedTypeConfig {
    pub fire_type: String,
}

impl MethodConfig for FixedTypeConfig {
    const FIELDS: &'static [ConfigField] = &[FIRE_TYPE];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            fire_type: attrs.string(FIRE_TYPE.name)?,
        })
    }
}

pub struct TypeFieldConfig {
    pub field: String,
}

impl MethodConfig for TypeFieldConfig {
    const FIELDS: &'static [ConfigField] = &[FIRE_TYPE_FIELD];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            field: attrs.string(FIRE_TYPE_FIELD.name)?,
        })
    }
}

pub struct FetsConfig {
    pub source_type_field: String,
    pub burn_type_field: String,
}

impl MethodConfig for FetsConfig {
    const FIELDS: &'static [ConfigField] = &[SOURCE_TYPE_FIELD, BURN_TYPE_FIELD];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            source_type_field: attrs.string(SOURCE_TYPE_FIELD.name)?,
            burn_type_field: attrs.string(BURN_TYPE_FIELD.name)?,
        })
    }
}

/// Lower-cased code to fire type, plus the type used for unknown codes.
#[derive(Debug, Clone, PartialEq)]
pub struct Crosswalk {
    codes: HashMap<String, String>,
    default_type: String,
}

impl Crosswalk {
    /// Parse `TYPE:code;code!TYPE:code`. The first type listed is the default.
    pub fn parse(text: &str) -> Option<Self> {
        let mut codes = HashMap::new();
        let mut default_type = None;
        for group in text.split('!') {
            let (fire_type, listed) = group.split_once(':')?;
            let fire_type = fire_type.trim();
            if fire_type.is_empty() {
                return None;
            }
            default_type.get_or_insert_with(|| fire_type.to_string());
            for code in listed.split(';').map(|c| c.trim().to_lowercase()).filter(|c| !c.is_empty()) {
                codes.insert(code, fire_type.to_string());
            }
        }
        Some(Self {
            codes,
            default_type: default_type?,
        })
    }

    fn lookup(&self, code: &str) -> &str {
        let code = code.trim().to_lowercase();
        match self.codes.get(&code) {
            Some(fire_type) => fire_type,
            None => {
                warn!("record has uncoded fire type {code:?}; using {}", self.default_type);
                &self.default_type
            }
        }
    }
}

pub struct CrosswalkConfig {
    pub field: String,
    pub crosswalk: Crosswalk,
}

impl MethodConfig for CrosswalkConfig {
    const FIELDS: &'static [ConfigField] = &[FIRE_TYPE_FIELD, FIRE_TYPE_CROSSWALK];

    fn from_attributes(attrs: &AttributeReader<'_>) -> Result<Self, ConfigError> {
        let text = attrs.string(FIRE_TYPE_CROSSWALK.name)?;
        let crosswalk = Crosswalk::parse(&text).ok_or_else(|| attrs.invalid(FIRE_TYPE_CROSSWALK.name, &text))?;
        Ok(Self {
            field: attrs.string(FIRE_TYPE_FIELD.name)?,
            crosswalk,
        })
    }
}

/// The same type for every fire.
pub struct FixedFireType {
    fire_type: String,
}

impl FixedFireType {
    pub fn new(config: FixedTypeConfig) -> Self {
        Self {
            fire_type: config.fire_type,
        }
    }
}

impl FireTypeMethod for FixedFireType {
    fn fire_type(&self, _fire: &Fire) -> String {
        self.fire_type.clone()
    }
}

/// How one record votes.
enum Classifier {
    Field(String),
    Fets { source_type: String, burn_type: String },
    Crosswalk { field: String, crosswalk: Crosswalk },
    Mtbs(String),
}

impl Classifier {
    fn classify(&self, record: &RawData) -> Option<String> {
        match self {
            Classifier::Field(field) => record.attr(field).map(str::to_string),
            Classifier::Fets { source_type, burn_type } => {
                let source_type = record.attr(source_type).unwrap_or_default();
                if source_type.eq_ignore_ascii_case(PRESCRIBED_FIRE) {
                    let broadcast = record.attr(burn_type) == Some(BROADCAST_BURN_CODE);
                    Some(if broadcast { PRESCRIBED_FIRE } else { PILE_BURN }.to_string())
                } else {
                    Some(source_type.to_string())
                }
            }
            Classifier::Crosswalk { field, crosswalk } => record.attr(field).map(|code| crosswalk.lookup(code).to_string()),
            Classifier::Mtbs(field) => Some(match record.attr(field) {
                None => MTBS_MISSING_TYPE.to_string(),
                Some(name) if name.contains(PRESCRIBED_FIRE) || name.contains("UNNAMED") => PRESCRIBED_FIRE.to_string(),
                Some(_) => WILDFIRE.to_string(),
            }),
        }
    }
}

/// Majority vote over every record of the fire.
pub struct VotedFireType {
    classifier: Classifier,
}

impl VotedFireType {
    pub fn get_field(config: TypeFieldConfig) -> Self {
        Self {
            classifier: Classifier::Field(config.field),
        }
    }

    pub fn fets(config: FetsConfig) -> Self {
        Self {
            classifier: Classifier::Fets {
                source_type: config.source_type_field,
                burn_type: config.burn_type_field,
            },
        }
    }

    pub fn field_crosswalk(config: CrosswalkConfig) -> Self {
        Self {
            classifier: Classifier::Crosswalk {
                field: config.field,
                crosswalk: config.crosswalk,
            },
        }
    }

    pub fn parse_mtbs(config: TypeFieldConfig) -> Self {
        Self {
            classifier: Classifier::Mtbs(config.field),
        }
    }
}

impl FireTypeMethod for VotedFireType {
    fn fire_type(&self, fire: &Fire) -> String {
        majority(fire.raw_data().filter_map(|r| self.classifier.classify(r)))
    }
}

/// Most frequent non-empty vote; the first type to reach the top count wins ties.
fn majority(votes: impl Iterator<Item = String>) -> String {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for vote in votes.filter(|v| !v.is_empty()) {
        match counts.iter_mut().find(|(t, _)| *t == vote) {
            Some((_, n)) => *n += 1,
            None => counts.push((vote, 1)),
        }
    }
    let mut best: Option<(String, usize)> = None;
    for (fire_type, n) in counts {
        if best.as_ref().is_none_or(|(_, top)| n > *top) {
            best = Some((fire_type, n));
        }
    }
    best.map(|(t, _)| t).unwrap_or_else(|| UNKNOWN_FIRE_TYPE.to_string())
}
