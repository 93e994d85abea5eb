//! Static cell-type shorthand dictionary.

/// How the cell `type` field is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellTypeNaming {
    /// Keep the source spelling.
    Passthrough,
    /// Rewrite known shorthands; ganglion types optionally get `RGC\`.
    FullName { prefix_rgc: bool },
}

impl Default for CellTypeNaming {
    fn default() -> Self {
        Self::FullName { prefix_rgc: true }
    }
}

impl CellTypeNaming {
    pub fn apply(self, raw: &str) -> String {
        match self {
            Self::Passthrough => raw.to_string(),
            Self::FullName { prefix_rgc } => full_cell_type_name(raw, prefix_rgc),
        }
    }
}

const FULL_NAMES: &[(&str, &str)] = &[
    ("OnP", "ON-parasol"),
    ("OffP", "OFF-parasol"),
    ("OnM", "ON-midget"),
    ("OffM", "OFF-midget"),
    ("BlueOffM", "Blue OFF-midget"),
    ("OnS", "ON-stratified"),
    ("OffS", "OFF-stratified"),
    ("SBC", "small-bistratified"),
    ("BT", "bistratified-transient"),
    ("Tufted", "tufted"),
    ("OnLarge", "ON-large"),
    ("OffLarge", "OFF-large"),
    ("OnMystery", "ON-mystery"),
    ("OffMystery", "OFF-mystery"),
    ("OffBoring", "OFF-boring"),
    ("OnWiggles", "ON-wiggles"),
    ("InterestingIfTrue", "interesting-if-true"),
    ("BigMas", "big-mas"),
    ("Spotty", "spotty"),
    ("Shadow", "shadow"),
    ("Blobby", "blobby"),
    ("Xmas", "xmas"),
    ("OnAmacrine", "ON-amacrine"),
    ("OffAmacrine", "OFF-amacrine"),
    ("BlueAmacrine", "blue-amacrine"),
    ("Amacrine", "amacrine"),
    ("A1", "A1-amacrine"),
    ("RB", "rod-bipolar"),
    ("BlueMystery", "blue-mystery"),
    ("BluePeaky", "blue-peaky"),
    ("RGC", "RGC"),
    ("Unknown", "unknown"),
];

// Ganglion subtypes; these get the `RGC\` prefix.
const RGC_TYPES: &[&str] = &[
    "OnP",
    "OffP",
    "OnM",
    "OffM",
    "BlueOffM",
    "OnS",
    "OffS",
    "SBC",
    "BT",
    "Tufted",
    "OnLarge",
    "OffLarge",
    "OnMystery",
    "OffMystery",
    "OffBoring",
    "OnWiggles",
    "InterestingIfTrue",
    "BigMas",
    "Spotty",
    "Shadow",
    "Blobby",
    "Xmas",
];

/// Maps a shorthand such as `OnP` to `RGC\ON-parasol`.
///
/// Unknown names are returned unchanged.
pub fn full_cell_type_name(shorthand: &str, prefix_rgc: bool) -> String {
    let Some((_, full)) = FULL_NAMES.iter().find(|(short, _)| *short == shorthand) else {
        return shorthand.to_string();
    };
    if prefix_rgc && RGC_TYPES.contains(&shorthand) {
        format!("RGC\\{full}")
    } else {
        (*full).to_string()
    }
}
