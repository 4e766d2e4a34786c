//! Human-readable labels for raw hardware codes.
//!
//! Machines store raw codes (`kvm`, `ac97`, ...). Presentation code asks for
//! labels through a [`LabelTable`] it passes in, so the entity itself never
//! carries display strings.

use std::collections::HashMap;

/// Lookup table from a raw code to its display name.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: HashMap<String, String>,
}

impl LabelTable {
    /// Builds a table from `(code, label)` pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let entries = pairs
            .into_iter()
            .map(|(code, label)| (code.to_string(), label.to_string()))
            .collect();
        Self { entries }
    }

    /// Label for `code`, or the raw code itself when the table has no entry.
    pub fn label<'a>(&'a self, code: &'a str) -> &'a str {
        self.entries.get(code).map(String::as_str).unwrap_or(code)
    }

    /// Joins the labels of `codes` with `", "`.
    ///
    /// With `show_code` each label is prefixed with its raw code, e.g.
    /// `kvm: Kernel-based Virtual Machine (KVM)`.
    pub fn format<S: AsRef<str>>(&self, codes: &[S], show_code: bool) -> String {
        codes
            .iter()
            .map(|code| {
                let code = code.as_ref();
                if show_code {
                    format!("{}: {}", code, self.label(code))
                } else {
                    self.label(code).to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Known hardware virtualization backends.
pub fn accelerators() -> LabelTable {
    LabelTable::from_pairs([
        ("kvm", "Kernel-based Virtual Machine (KVM)"),
        ("tcg", "Tiny Code Generator (TCG)"),
        ("hax", "Hardware Accelerated Execution Manager (HAXM)"),
        ("whpx", "Windows Hypervisor Platform (WHPX)"),
        ("hvf", "Hypervisor.framework (HVF)"),
    ])
}

/// Known emulated sound cards.
pub fn sound_cards() -> LabelTable {
    LabelTable::from_pairs([
        ("ac97", "Intel AC97(82801AA)"),
        ("es1370", "ENSONIQ AudioPCI ES1370"),
        ("sb16", "Creative Sound Blaster 16"),
        ("hda", "Intel HD Audio"),
        ("pcspk", "PC speaker"),
        ("gus", "Gravis Ultrasound GF1"),
        ("cs4231a", "CS4231A"),
        ("adlib", "Yamaha YM3812 (OPL2)"),
    ])
}

/// Icon classification for the catalog: OS version lower-cased with spaces
/// replaced by underscores (`"Debian 12"` → `"debian_12"`).
pub fn os_icon(os_version: &str) -> String {
    os_version.to_lowercase().replace(' ', "_")
}
