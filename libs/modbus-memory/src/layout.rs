//! Memory layout: field definitions mapped onto the coil and register spaces
//!
//! A [`MemoryLayout`] is built once from configuration and never mutated
//! afterwards. It answers three questions:
//! - do any two fields share an address (or, for `BIT` fields, a bit)?
//! - which external address does index 0 of each backing array map to?
//! - how large must the backing arrays be?

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::types::{DataType, RegisterKind};

/// Highest exclusive end address a field may reach
const ADDRESS_SPACE_END: u32 = 0x1_0000;

/// One field definition
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemoryEntry {
    /// External (absolute) address
    pub address: u16,
    pub kind: RegisterKind,
    /// `None` is only valid for coils
    pub data_type: Option<DataType>,
    /// Bit index for `BIT` fields (0-15)
    pub bit: u8,
    /// Fixed-point factor; zero disables scaling
    pub scale: f64,
    /// Word count for `STRING`, or an explicit footprint override
    pub length: u16,
    /// Write side only: coil value applied once at start-up
    pub coil_initial_value: bool,
    /// Write side only: hash of the owning measurement name and tags
    pub hash_id: u64,
    pub field: String,
    pub measurement: String,
}

impl MemoryEntry {
    pub fn coil(address: u16) -> Self {
        Self {
            address,
            kind: RegisterKind::Coil,
            ..Default::default()
        }
    }

    pub fn register(address: u16, data_type: DataType) -> Self {
        Self {
            address,
            kind: RegisterKind::Register,
            data_type: Some(data_type),
            ..Default::default()
        }
    }

    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit = bit;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    pub fn with_field(mut self, measurement: impl Into<String>, field: impl Into<String>) -> Self {
        self.measurement = measurement.into();
        self.field = field.into();
        self
    }

    pub fn with_hash_id(mut self, hash_id: u64) -> Self {
        self.hash_id = hash_id;
        self
    }

    /// `(start, end, bit)` with `end` exclusive
    ///
    /// Coils are one address wide. A non-zero `length` overrides the
    /// type-derived width. A register entry without a type yields `(0, 0, 0)`.
    pub fn bounds(&self) -> (u32, u32, u8) {
        let start = u32::from(self.address);
        if self.kind.is_coil() {
            return (start, start + 1, 0);
        }
        if self.length > 0 {
            return (start, start + u32::from(self.length), 0);
        }
        match self.data_type {
            Some(t) => (start, start + u32::from(t.word_width()), self.bit),
            None => (0, 0, 0),
        }
    }

    fn label(&self) -> String {
        if self.measurement.is_empty() {
            self.field.clone()
        } else {
            format!("{}.{}", self.measurement, self.field)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WordOwner {
    /// Whole word claimed by a non-`BIT` field
    Word,
    /// Word shared by `BIT` fields
    Bits,
}

/// Ordered collection of [`MemoryEntry`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryLayout(Vec<MemoryEntry>);

impl MemoryLayout {
    pub fn new(entries: Vec<MemoryEntry>) -> Self {
        Self(entries)
    }

    pub fn push(&mut self, entry: MemoryEntry) {
        self.0.push(entry);
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MemoryEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Detect fields sharing an address.
    ///
    /// Overlaps are advisory: they are returned as diagnostics and the caller
    /// decides what to do with them. Only a register entry without a type or
    /// a bit index of 16 or more is an error.
    pub fn has_overlap(&self) -> Result<(bool, Vec<String>)> {
        let mut diagnostics = Vec::new();
        let mut coils: FxHashSet<u16> = FxHashSet::default();
        let mut words: FxHashMap<u32, WordOwner> = FxHashMap::default();
        let mut bits: FxHashMap<u16, u16> = FxHashMap::default();

        for entry in &self.0 {
            if entry.kind.is_coil() {
                if !coils.insert(entry.address) {
                    diagnostics.push(format!(
                        "coil {} of field {:?} is already used",
                        entry.address,
                        entry.label()
                    ));
                }
                continue;
            }

            let data_type = entry.data_type.ok_or_else(|| MemoryError::UnsupportedType {
                address: entry.address,
                type_name: String::new(),
            })?;

            if data_type == DataType::Bit && entry.bit >= 16 {
                return Err(MemoryError::BitOutOfRange {
                    address: entry.address,
                    bit: entry.bit,
                });
            }

            if data_type == DataType::Bit && entry.length == 0 {
                let mask = bits.entry(entry.address).or_default();
                if *mask & (1 << entry.bit) != 0 {
                    diagnostics.push(format!(
                        "bit {} of register {} (field {:?}) is already used",
                        entry.bit,
                        entry.address,
                        entry.label()
                    ));
                }
                *mask |= 1 << entry.bit;

                let address = u32::from(entry.address);
                match words.get(&address) {
                    Some(WordOwner::Word) => diagnostics.push(format!(
                        "bit field {:?} shares register {} with a whole-word field",
                        entry.label(),
                        entry.address
                    )),
                    Some(WordOwner::Bits) => {},
                    None => {
                        words.insert(address, WordOwner::Bits);
                    },
                }
                continue;
            }

            let (start, end, _) = entry.bounds();
            let mut collision = None;
            for address in start..end {
                if words.insert(address, WordOwner::Word).is_some() && collision.is_none() {
                    collision = Some(address);
                }
            }
            if let Some(address) = collision {
                diagnostics.push(format!(
                    "register {} of field {:?} ({} at {}..{}) is already used",
                    address,
                    entry.label(),
                    data_type,
                    start,
                    end
                ));
            }
        }

        debug!(
            "Overlap check on {} entries: {} diagnostics",
            self.0.len(),
            diagnostics.len()
        );
        Ok((!diagnostics.is_empty(), diagnostics))
    }

    /// Reject entries whose footprint runs past address 65535.
    pub fn check_address_space(&self) -> Result<()> {
        for entry in &self.0 {
            let (_, end, _) = entry.bounds();
            if end > ADDRESS_SPACE_END {
                return Err(MemoryError::AddressSpaceExceeded {
                    address: entry.address,
                    end,
                });
            }
        }
        Ok(())
    }

    /// `(coil_offset, register_offset)`: lowest address of each kind
    ///
    /// A kind without entries reports `u16::MAX`.
    pub fn get_memory_offsets(&self) -> (u16, u16) {
        self.0
            .iter()
            .fold((u16::MAX, u16::MAX), |(coil, register), entry| {
                if entry.kind.is_coil() {
                    (coil.min(entry.address), register)
                } else {
                    (coil, register.min(entry.address))
                }
            })
    }

    /// `(max_coil, max_register)`: highest address occupied by each kind
    ///
    /// Multi-word fields count their last word.
    pub fn get_max_addresses(&self) -> (u32, u32) {
        self.0.iter().fold((0, 0), |(coil, register), entry| {
            let (start, end, _) = entry.bounds();
            if entry.kind.is_coil() {
                (coil.max(start), register)
            } else {
                (coil, register.max(end.saturating_sub(1).max(start)))
            }
        })
    }

    /// Zero-initialised backing arrays sized to cover every entry
    pub fn get_coils_and_registers(&self) -> (Vec<bool>, Vec<u16>) {
        let (coil_offset, register_offset) = self.get_memory_offsets();
        let (max_coil, max_register) = self.get_max_addresses();

        let has_coils = self.0.iter().any(|e| e.kind.is_coil());
        let has_registers = self.0.iter().any(|e| !e.kind.is_coil());

        let coils_len = if has_coils {
            max_coil - u32::from(coil_offset) + 1
        } else {
            0
        };
        let registers_len = if has_registers {
            max_register - u32::from(register_offset) + 1
        } else {
            0
        };

        (
            vec![false; coils_len as usize],
            vec![0; registers_len as usize],
        )
    }

    /// Group entries by hash ID, then by field name.
    pub fn get_memory_mapped_by_hash_id(
        &self,
    ) -> FxHashMap<u64, FxHashMap<String, MemoryEntry>> {
        let mut mapped: FxHashMap<u64, FxHashMap<String, MemoryEntry>> = FxHashMap::default();
        for entry in &self.0 {
            mapped.entry(entry.hash_id).or_default();
        }
        for entry in &self.0 {
            if let Some(fields) = mapped.get_mut(&entry.hash_id) {
                fields.insert(entry.field.clone(), entry.clone());
            }
        }
        mapped
    }
}

impl From<Vec<MemoryEntry>> for MemoryLayout {
    fn from(entries: Vec<MemoryEntry>) -> Self {
        Self(entries)
    }
}

impl FromIterator<MemoryEntry> for MemoryLayout {
    fn from_iter<I: IntoIterator<Item = MemoryEntry>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a MemoryLayout {
    type Item = &'a MemoryEntry;
    type IntoIter = std::slice::Iter<'a, MemoryEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn bit(address: u16, bit: u8) -> MemoryEntry {
        MemoryEntry::register(address, DataType::Bit).with_bit(bit)
    }

    #[test]
    fn test_bounds_widths() {
        assert_eq!(MemoryEntry::coil(7).bounds(), (7, 8, 0));
        assert_eq!(bit(3, 5).bounds(), (3, 4, 5));
        assert_eq!(
            MemoryEntry::register(10, DataType::Float32).bounds(),
            (10, 12, 0)
        );
        assert_eq!(
            MemoryEntry::register(10, DataType::Uint64).bounds(),
            (10, 14, 0)
        );
        assert_eq!(
            MemoryEntry::register(10, DataType::String)
                .with_length(5)
                .bounds(),
            (10, 15, 0)
        );
        assert_eq!(bit(3, 5).with_length(2).bounds(), (3, 5, 0));

        let untyped = MemoryEntry {
            address: 9,
            ..Default::default()
        };
        assert_eq!(untyped.bounds(), (0, 0, 0));
    }

    #[test]
    fn test_sixteen_bits_share_one_register() {
        let layout: MemoryLayout = (0..16).map(|b| bit(0, b)).collect();
        let (overlap, diagnostics) = layout.has_overlap().unwrap();
        assert!(!overlap);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_adjacent_fields_do_not_overlap() {
        let layout = MemoryLayout::new(vec![
            bit(0, 0),
            MemoryEntry::register(1, DataType::Uint16),
            MemoryEntry::register(3, DataType::Float32),
        ]);
        assert!(!layout.has_overlap().unwrap().0);

        let layout = MemoryLayout::new(vec![
            bit(0, 0),
            MemoryEntry::register(1, DataType::Uint16),
            MemoryEntry::register(2, DataType::Float32),
        ]);
        assert!(!layout.has_overlap().unwrap().0);
    }

    #[test]
    fn test_bit_index_checked_with_explicit_length() {
        let layout = MemoryLayout::new(vec![bit(0, 20).with_length(1)]);
        assert!(matches!(
            layout.has_overlap(),
            Err(MemoryError::BitOutOfRange { address: 0, bit: 20 })
        ));

        let layout = MemoryLayout::new(vec![bit(0, 15).with_length(1)]);
        assert!(!layout.has_overlap().unwrap().0);
    }

    #[test]
    fn test_multi_word_overlap_is_reported() {
        let layout = MemoryLayout::new(vec![
            bit(0, 0),
            MemoryEntry::register(1, DataType::Float32).with_field("m", "f"),
            MemoryEntry::register(2, DataType::Uint16).with_field("m", "u"),
        ]);
        let (overlap, diagnostics) = layout.has_overlap().unwrap();
        assert!(overlap);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].contains("m.u"));
    }

    #[test]
    fn test_reused_bit_and_bit_on_word() {
        let layout = MemoryLayout::new(vec![bit(4, 2), bit(4, 2)]);
        let (overlap, diagnostics) = layout.has_overlap().unwrap();
        assert!(overlap);
        assert_eq!(diagnostics.len(), 1);

        let layout = MemoryLayout::new(vec![MemoryEntry::register(4, DataType::Int16), bit(4, 0)]);
        assert!(layout.has_overlap().unwrap().0);

        let layout = MemoryLayout::new(vec![bit(4, 0), MemoryEntry::register(4, DataType::Int16)]);
        assert!(layout.has_overlap().unwrap().0);
    }

    #[test]
    fn test_coils_and_registers_are_disjoint() {
        let layout = MemoryLayout::new(vec![
            MemoryEntry::coil(1),
            MemoryEntry::register(1, DataType::Uint16),
        ]);
        assert!(!layout.has_overlap().unwrap().0);

        let layout = MemoryLayout::new(vec![MemoryEntry::coil(1), MemoryEntry::coil(1)]);
        assert!(layout.has_overlap().unwrap().0);
    }

    #[test]
    fn test_hard_errors() {
        let layout = MemoryLayout::new(vec![bit(0, 16)]);
        assert_eq!(
            layout.has_overlap(),
            Err(MemoryError::BitOutOfRange { address: 0, bit: 16 })
        );

        let untyped = MemoryEntry {
            address: 2,
            ..Default::default()
        };
        let layout = MemoryLayout::new(vec![untyped]);
        assert!(matches!(
            layout.has_overlap(),
            Err(MemoryError::UnsupportedType { address: 2, .. })
        ));
    }

    #[test]
    fn test_offsets_and_sizes() {
        let layout = MemoryLayout::new(vec![
            MemoryEntry::coil(1),
            MemoryEntry::coil(3),
            bit(40000, 0),
            bit(40000, 1),
            MemoryEntry::register(40001, DataType::Uint32),
            MemoryEntry::register(40003, DataType::Uint32),
        ]);
        assert_eq!(layout.get_memory_offsets(), (1, 40000));
        assert_eq!(layout.get_max_addresses(), (3, 40004));

        let (coils, registers) = layout.get_coils_and_registers();
        assert_eq!(coils.len(), 3);
        assert_eq!(registers.len(), 5);
        assert!(coils.iter().all(|c| !c));
        assert!(registers.iter().all(|r| *r == 0));
    }

    #[test]
    fn test_offsets_without_entries_of_a_kind() {
        let layout = MemoryLayout::new(vec![MemoryEntry::register(5, DataType::Int64)]);
        assert_eq!(layout.get_memory_offsets(), (u16::MAX, 5));
        let (coils, registers) = layout.get_coils_and_registers();
        assert!(coils.is_empty());
        assert_eq!(registers.len(), 4);
    }

    #[test]
    fn test_address_space_check() {
        let layout = MemoryLayout::new(vec![MemoryEntry::register(65535, DataType::Uint16)]);
        assert!(layout.check_address_space().is_ok());

        let layout = MemoryLayout::new(vec![MemoryEntry::register(65534, DataType::Float64)]);
        assert_eq!(
            layout.check_address_space(),
            Err(MemoryError::AddressSpaceExceeded {
                address: 65534,
                end: 65538
            })
        );
    }

    #[test]
    fn test_mapped_by_hash_id() {
        let layout = MemoryLayout::new(vec![
            MemoryEntry::coil(0).with_field("a", "on").with_hash_id(1),
            MemoryEntry::register(0, DataType::Uint16)
                .with_field("a", "count")
                .with_hash_id(1),
            MemoryEntry::register(1, DataType::Uint16)
                .with_field("a", "count")
                .with_hash_id(2),
        ]);
        let mapped = layout.get_memory_mapped_by_hash_id();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[&1].len(), 2);
        assert_eq!(mapped[&1]["count"].address, 0);
        assert_eq!(mapped[&2]["count"].address, 1);
    }
}
