//! Registry of the Teleinfo fields known by the exporter
use std::fmt;

use teleinfo_exporter_macros::teleinfo_checksum_str;

/// Semantic type of a Teleinfo field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Value fixed for the meter (address, maximum current)
    Constant,
    /// Descriptive text (tarif option, current period)
    StringLabel,
    /// Monotonic index
    Counter,
    /// Instantaneous value
    Gauge,
    /// Field without any known meaning for monitoring
    Unknown,
}

impl FieldKind {
    /// Indicate if the field is exported as a numeric sample (otherwise it's a label)
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Counter | FieldKind::Gauge)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldKind::Constant => write!(f, "constant"),
            FieldKind::StringLabel => write!(f, "string"),
            FieldKind::Counter => write!(f, "counter"),
            FieldKind::Gauge => write!(f, "gauge"),
            FieldKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Teleinfo tags of the historical meter format
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum Tag {
    /// Address of the meter
    ADCO = 0,
    /// Tarif option
    OPTARIF = 1,
    /// Subscribe amps
    ISOUSC = 2,
    /// Base index option (Wh)
    BASE = 3,
    /// Dig index option (Wh)
    HCHC = 4,
    /// Full index option (Wh)
    HCHP = 5,
    /// Current period pricing
    PTEC = 6,
    /// Instantaneous current (A)
    IINST = 7,
    /// Maximum current (A)
    IMAX = 8,
    /// Appear power (VA)
    PAPP = 9,
    /// Low/High period schedule
    HHPHC = 10,
    /// State word of the meter
    MOTDETAT = 11,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(LINKY_FIELDS[*self as usize].label)
    }
}

/// Description of a known Teleinfo field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub tag: Tag,
    /// Label as written on the wire
    pub label: &'static str,
    /// Sum of the label characters, computed at compile time
    pub label_checksum: u64,
    pub description: &'static str,
    pub kind: FieldKind,
}

macro_rules! field {
    ($tag:ident, $description:expr, $kind:ident) => {
        FieldSpec {
            tag: Tag::$tag,
            label: stringify!($tag),
            label_checksum: teleinfo_checksum_str!($tag),
            description: $description,
            kind: FieldKind::$kind,
        }
    };
}

// Indexed by `Tag` discriminant
static LINKY_FIELDS: [FieldSpec; 12] = [
    field!(ADCO, "Adresse du Compteur", Constant),
    field!(OPTARIF, "Option Tarifaire Choisie", StringLabel),
    field!(ISOUSC, "Intensité Souscrite en A", Gauge),
    field!(BASE, "Index Option Base en Wh", Counter),
    field!(HCHC, "Index Heure Creuse en Wh", Counter),
    field!(HCHP, "Index Heure Pleine en Wh", Counter),
    field!(PTEC, "Période Tarifaire En Cours", StringLabel),
    field!(IINST, "Intensité Instantanée en A", Gauge),
    field!(IMAX, "Intensité Maximale Appelée en A", Constant),
    field!(PAPP, "Puissance Apparente en VA", Gauge),
    field!(HHPHC, "Horaire Heures Pleines Heures Creuses", Unknown),
    field!(MOTDETAT, "Mot d'État du compteur", Unknown),
];

/// Read only table of the fields handled by the exporter.
///
/// Built once at startup and handed by reference to the decoder and the classifier.
#[derive(Debug, Clone, Copy)]
pub struct FieldRegistry {
    fields: &'static [FieldSpec],
}

impl FieldRegistry {
    /// Registry of the Linky meter in historical mode
    pub fn linky() -> FieldRegistry {
        FieldRegistry {
            fields: &LINKY_FIELDS,
        }
    }

    /// Getter of a field from its tag
    pub fn get(&self, tag: Tag) -> &FieldSpec {
        &self.fields[tag as usize]
    }

    /// Find a field from its wire label. Return `None` for labels unknown by the registry
    pub fn lookup(&self, label: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.label == label)
    }

    /// Indicate if a raw line contains the label of a known field
    pub fn contains_known_label(&self, line: &[u8]) -> bool {
        self.fields.iter().any(|field| {
            line.windows(field.label.len())
                .any(|window| window == field.label.as_bytes())
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::linky()
    }
}
