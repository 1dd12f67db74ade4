//! Dataset dictionary.
//!
//! The dictionary is the runtime type system of the stack: primitive kinds
//! with fixed wire widths, compound datasets built from ordered element
//! lists, and the ComId map binding telegrams to their payload schema. It is
//! validated once when the session opens and read-only afterwards, so the
//! engines share it without locking.

use crate::error::{Result, TrdpError};
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::mem;

pub type TypeId = u32;
pub type ComId = u32;

/// Smallest identifier a compound dataset may use; below live the
/// primitives.
pub const DATASET_ID_MIN: TypeId = 1000;

/// Primitive wire kinds, identifiers 1 through 17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Primitive {
    /// Boolean or bit field, one octet. See [`BitsetKind`].
    Bool8,
    Char8,
    Utf16,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Real32,
    Real64,
    /// Seconds since the UNIX epoch, 32 bit.
    TimeDate32,
    /// 32-bit seconds plus 16-bit ticks of 1/65536 s.
    TimeDate48,
    /// 32-bit seconds plus 32-bit microseconds.
    TimeDate64,
    /// SDTv2 safety code over the payload.
    Sc32,
}

impl Primitive {
    pub fn from_type_id(id: TypeId) -> Option<Primitive> {
        Some(match id {
            1 => Primitive::Bool8,
            2 => Primitive::Char8,
            3 => Primitive::Utf16,
            4 => Primitive::Int8,
            5 => Primitive::Int16,
            6 => Primitive::Int32,
            7 => Primitive::Int64,
            8 => Primitive::UInt8,
            9 => Primitive::UInt16,
            10 => Primitive::UInt32,
            11 => Primitive::UInt64,
            12 => Primitive::Real32,
            13 => Primitive::Real64,
            14 => Primitive::TimeDate32,
            15 => Primitive::TimeDate48,
            16 => Primitive::TimeDate64,
            17 => Primitive::Sc32,
            _ => return None,
        })
    }

    pub fn type_id(self) -> TypeId {
        match self {
            Primitive::Bool8 => 1,
            Primitive::Char8 => 2,
            Primitive::Utf16 => 3,
            Primitive::Int8 => 4,
            Primitive::Int16 => 5,
            Primitive::Int32 => 6,
            Primitive::Int64 => 7,
            Primitive::UInt8 => 8,
            Primitive::UInt16 => 9,
            Primitive::UInt32 => 10,
            Primitive::UInt64 => 11,
            Primitive::Real32 => 12,
            Primitive::Real64 => 13,
            Primitive::TimeDate32 => 14,
            Primitive::TimeDate48 => 15,
            Primitive::TimeDate64 => 16,
            Primitive::Sc32 => 17,
        }
    }

    /// Octets one value occupies on the wire (packed).
    pub fn wire_width(self) -> usize {
        match self {
            Primitive::Bool8 | Primitive::Char8 | Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Utf16 | Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Int32
            | Primitive::UInt32
            | Primitive::Real32
            | Primitive::TimeDate32
            | Primitive::Sc32 => 4,
            Primitive::TimeDate48 => 6,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Real64 | Primitive::TimeDate64 => 8,
        }
    }

    /// Octets one value occupies in the host buffer. TIMEDATE48 carries two
    /// trailing padding octets there, everything else matches the wire.
    pub fn host_width(self) -> usize {
        match self {
            Primitive::TimeDate48 => 8,
            other => other.wire_width(),
        }
    }

    /// Natural host alignment of the value.
    pub fn host_align(self) -> usize {
        match self {
            Primitive::TimeDate48 | Primitive::TimeDate64 => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Real64 => {
                mem::align_of::<u64>()
            }
            other => other.wire_width(),
        }
    }

    /// True for the integer kinds that may supply a variable array length.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Primitive::Int8
                | Primitive::Int16
                | Primitive::Int32
                | Primitive::Int64
                | Primitive::UInt8
                | Primitive::UInt16
                | Primitive::UInt32
                | Primitive::UInt64
        )
    }
}

/// Interpretation of a one-octet BOOL8/BITSET8 element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitsetKind {
    /// All eight bits significant.
    Bitset8,
    /// Zero is false, anything else is true.
    Bool8,
    /// 0b01 is false, 0b10 is true, everything else is a data fault.
    Antivalent8,
}

impl BitsetKind {
    /// Interprets one raw octet; `None` marks an antivalent data fault.
    pub fn as_bool(self, raw: u8) -> Option<bool> {
        match self {
            BitsetKind::Bitset8 => Some(raw != 0),
            BitsetKind::Bool8 => Some(raw != 0),
            BitsetKind::Antivalent8 => match raw {
                0b01 => Some(false),
                0b10 => Some(true),
                _ => None,
            },
        }
    }
}

impl Default for BitsetKind {
    fn default() -> BitsetKind {
        BitsetKind::Bitset8
    }
}

/// Byte order of one numeric element on the wire. Big-endian unless the
/// dictionary says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireOrder {
    Big,
    Little,
}

impl Default for WireOrder {
    fn default() -> WireOrder {
        WireOrder::Big
    }
}

/// One member of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub name: String,
    /// Primitive kind (1..=17) or nested dataset (>= 1000).
    pub type_id: TypeId,
    /// 1 scalar, N > 1 fixed array, 0 variable array sized at runtime by the
    /// preceding integer element.
    #[serde(default = "default_cardinality")]
    pub cardinality: u32,
    #[serde(default)]
    pub unit: String,
    /// Engineering scale; 0.0 means unscaled.
    #[serde(default)]
    pub scale: f64,
    #[serde(default)]
    pub offset: i32,
    #[serde(default)]
    pub order: WireOrder,
    #[serde(default)]
    pub bitset: BitsetKind,
}

fn default_cardinality() -> u32 {
    1
}

impl Element {
    pub fn primitive(&self) -> Option<Primitive> {
        Primitive::from_type_id(self.type_id)
    }

    #[inline]
    pub fn is_variable(&self) -> bool {
        self.cardinality == 0
    }

    /// Applies the element's engineering scale and offset to a raw value.
    pub fn apply_scale(&self, raw: f64) -> f64 {
        if self.scale != 0.0 {
            raw * self.scale + f64::from(self.offset)
        } else {
            raw + f64::from(self.offset)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: TypeId,
    #[serde(default)]
    pub name: String,
    pub elements: Vec<Element>,
}

/// Binds a published or subscribed telegram to its payload schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComIdMapping {
    pub com_id: ComId,
    pub dataset_id: TypeId,
}

/// The validated, immutable type registry.
#[derive(Debug, Default)]
pub struct Dictionary {
    datasets: Vec<Dataset>,
    index: HashMap<TypeId, usize>,
    com_map: HashMap<ComId, TypeId>,
}

/// Resolved position of a dataset inside the dictionary; hand the same slot
/// back on repeated calls to skip the id lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetRef {
    pub(crate) id: TypeId,
    pub(crate) index: usize,
}

impl Dictionary {
    /// Builds and validates a dictionary. Rejected are: dataset identifiers
    /// below [`DATASET_ID_MIN`] or duplicated, element types that resolve
    /// neither to a primitive nor to a defined dataset, datasets reachable
    /// from themselves, variable arrays not preceded by an integer scalar,
    /// and ComId mappings onto undefined datasets.
    pub fn new(datasets: Vec<Dataset>, mappings: &[ComIdMapping]) -> Result<Dictionary> {
        let mut index = HashMap::with_capacity(datasets.len());
        for (pos, ds) in datasets.iter().enumerate() {
            if ds.id < DATASET_ID_MIN {
                return Err(TrdpError::structure(format!(
                    "dataset id {} below minimum {}",
                    ds.id, DATASET_ID_MIN
                )));
            }
            if index.insert(ds.id, pos).is_some() {
                return Err(TrdpError::structure(format!("duplicate dataset id {}", ds.id)));
            }
        }

        let dict = Dictionary { datasets, index, com_map: HashMap::new() };

        for ds in &dict.datasets {
            dict.validate_elements(ds)?;
        }
        let mut states = vec![Visit::Unseen; dict.datasets.len()];
        for pos in 0..dict.datasets.len() {
            dict.check_cycles(pos, &mut states)?;
        }

        let mut dict = dict;
        for mapping in mappings {
            if !dict.index.contains_key(&mapping.dataset_id) {
                return Err(TrdpError::structure(format!(
                    "ComId {} mapped to undefined dataset {}",
                    mapping.com_id, mapping.dataset_id
                )));
            }
            dict.com_map.insert(mapping.com_id, mapping.dataset_id);
        }
        Ok(dict)
    }

    fn validate_elements(&self, ds: &Dataset) -> Result<()> {
        let mut prev: Option<&Element> = None;
        for el in &ds.elements {
            if el.type_id == ds.id {
                return Err(TrdpError::structure(format!(
                    "dataset {} recurses into itself via element '{}'",
                    ds.id, el.name
                )));
            }
            if el.primitive().is_none() && !self.index.contains_key(&el.type_id) {
                return Err(TrdpError::structure(format!(
                    "dataset {} element '{}' has unresolvable type {}",
                    ds.id, el.name, el.type_id
                )));
            }
            if el.is_variable() {
                let supplier = prev.ok_or_else(|| {
                    TrdpError::structure(format!(
                        "dataset {} starts with a variable array",
                        ds.id
                    ))
                })?;
                let ok = supplier.cardinality == 1
                    && supplier.primitive().map_or(false, Primitive::is_integer);
                if !ok {
                    return Err(TrdpError::structure(format!(
                        "dataset {} variable array '{}' not preceded by an integer scalar",
                        ds.id, el.name
                    )));
                }
            }
            prev = Some(el);
        }
        Ok(())
    }

    fn check_cycles(&self, pos: usize, states: &mut [Visit]) -> Result<()> {
        match states[pos] {
            Visit::Done => return Ok(()),
            Visit::Active => {
                return Err(TrdpError::structure(format!(
                    "dataset {} is reachable from itself",
                    self.datasets[pos].id
                )))
            }
            Visit::Unseen => (),
        }
        states[pos] = Visit::Active;
        for el in &self.datasets[pos].elements {
            if let Some(&child) = self.index.get(&el.type_id) {
                self.check_cycles(child, states)?;
            }
        }
        states[pos] = Visit::Done;
        Ok(())
    }

    #[inline]
    pub fn dataset(&self, id: TypeId) -> Option<&Dataset> {
        self.index.get(&id).map(|&pos| &self.datasets[pos])
    }

    /// Resolves a dataset id, optionally through a caller-held cache slot so
    /// repeated calls skip the map lookup.
    pub fn resolve(&self, id: TypeId, cache: &mut Option<DatasetRef>) -> Result<&Dataset> {
        if let Some(slot) = *cache {
            if slot.id == id {
                return Ok(&self.datasets[slot.index]);
            }
        }
        let index = *self
            .index
            .get(&id)
            .ok_or_else(|| TrdpError::structure(format!("unknown dataset {}", id)))?;
        *cache = Some(DatasetRef { id, index });
        Ok(&self.datasets[index])
    }

    #[inline]
    pub fn dataset_id_for(&self, com_id: ComId) -> Option<TypeId> {
        self.com_map.get(&com_id).copied()
    }

    pub fn dataset_for_com_id(&self, com_id: ComId) -> Option<&Dataset> {
        self.dataset_id_for(com_id).and_then(|id| self.dataset(id))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unseen,
    Active,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(name: &str, type_id: TypeId) -> Element {
        Element {
            name: name.to_string(),
            type_id,
            cardinality: 1,
            unit: String::new(),
            scale: 0.0,
            offset: 0,
            order: WireOrder::Big,
            bitset: BitsetKind::Bitset8,
        }
    }

    fn array(name: &str, type_id: TypeId, cardinality: u32) -> Element {
        Element { cardinality, ..scalar(name, type_id) }
    }

    #[test]
    fn test_primitive_ids_roundtrip() {
        for id in 1..=17 {
            let prim = Primitive::from_type_id(id).unwrap();
            assert_eq!(prim.type_id(), id);
        }
        assert_eq!(Primitive::from_type_id(0), None);
        assert_eq!(Primitive::from_type_id(18), None);
    }

    #[test]
    fn test_wire_widths() {
        assert_eq!(Primitive::Bool8.wire_width(), 1);
        assert_eq!(Primitive::Utf16.wire_width(), 2);
        assert_eq!(Primitive::Real32.wire_width(), 4);
        assert_eq!(Primitive::TimeDate48.wire_width(), 6);
        assert_eq!(Primitive::TimeDate64.wire_width(), 8);
        assert_eq!(Primitive::UInt64.wire_width(), 8);
    }

    #[test]
    fn test_timedate48_host_width_is_padded() {
        assert_eq!(Primitive::TimeDate48.host_width(), 8);
        assert_eq!(Primitive::TimeDate48.host_align(), 4);
    }

    #[test]
    fn test_valid_dictionary() {
        let dict = Dictionary::new(
            vec![
                Dataset {
                    id: 1001,
                    name: "inner".to_string(),
                    elements: vec![scalar("a", 9), scalar("b", 12)],
                },
                Dataset {
                    id: 1002,
                    name: "outer".to_string(),
                    elements: vec![scalar("count", 9), array("inner", 1001, 0)],
                },
            ],
            &[ComIdMapping { com_id: 2000, dataset_id: 1002 }],
        )
        .unwrap();

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.dataset_id_for(2000), Some(1002));
        assert_eq!(dict.dataset_for_com_id(2000).unwrap().id, 1002);
        assert!(dict.dataset_for_com_id(9999).is_none());
    }

    #[test]
    fn test_rejects_low_dataset_id() {
        let err = Dictionary::new(
            vec![Dataset { id: 999, name: String::new(), elements: vec![scalar("a", 8)] }],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, TrdpError::StructureMismatch(_)));
    }

    #[test]
    fn test_rejects_duplicate_dataset_id() {
        let ds = Dataset { id: 1001, name: String::new(), elements: vec![scalar("a", 8)] };
        assert!(Dictionary::new(vec![ds.clone(), ds], &[]).is_err());
    }

    #[test]
    fn test_rejects_direct_recursion() {
        let err = Dictionary::new(
            vec![Dataset {
                id: 1001,
                name: String::new(),
                elements: vec![scalar("self", 1001)],
            }],
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("recurses"));
    }

    #[test]
    fn test_rejects_mutual_recursion() {
        let err = Dictionary::new(
            vec![
                Dataset { id: 1001, name: String::new(), elements: vec![scalar("b", 1002)] },
                Dataset { id: 1002, name: String::new(), elements: vec![scalar("a", 1001)] },
            ],
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("reachable"));
    }

    #[test]
    fn test_rejects_unresolvable_type() {
        let err = Dictionary::new(
            vec![Dataset { id: 1001, name: String::new(), elements: vec![scalar("x", 500)] }],
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("unresolvable"));
    }

    #[test]
    fn test_rejects_variable_array_without_length_supplier() {
        // Leading variable array.
        assert!(Dictionary::new(
            vec![Dataset {
                id: 1001,
                name: String::new(),
                elements: vec![array("v", 10, 0)],
            }],
            &[],
        )
        .is_err());

        // Preceded by a float, not an integer.
        assert!(Dictionary::new(
            vec![Dataset {
                id: 1001,
                name: String::new(),
                elements: vec![scalar("f", 12), array("v", 10, 0)],
            }],
            &[],
        )
        .is_err());

        // Preceded by an integer array, not a scalar.
        assert!(Dictionary::new(
            vec![Dataset {
                id: 1001,
                name: String::new(),
                elements: vec![array("ns", 9, 4), array("v", 10, 0)],
            }],
            &[],
        )
        .is_err());
    }

    #[test]
    fn test_rejects_mapping_to_undefined_dataset() {
        let err = Dictionary::new(
            vec![Dataset { id: 1001, name: String::new(), elements: vec![scalar("a", 8)] }],
            &[ComIdMapping { com_id: 1, dataset_id: 4242 }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_resolve_populates_cache() {
        let dict = Dictionary::new(
            vec![Dataset { id: 1001, name: String::new(), elements: vec![scalar("a", 8)] }],
            &[],
        )
        .unwrap();

        let mut cache = None;
        assert_eq!(dict.resolve(1001, &mut cache).unwrap().id, 1001);
        let slot = cache.expect("cache filled");
        assert_eq!(dict.resolve(1001, &mut cache).unwrap().id, 1001);
        assert_eq!(cache, Some(slot));
        assert!(dict.resolve(4000, &mut cache).is_err());
    }

    #[test]
    fn test_antivalent_interpretation() {
        assert_eq!(BitsetKind::Antivalent8.as_bool(0b01), Some(false));
        assert_eq!(BitsetKind::Antivalent8.as_bool(0b10), Some(true));
        assert_eq!(BitsetKind::Antivalent8.as_bool(0b11), None);
        assert_eq!(BitsetKind::Antivalent8.as_bool(0), None);
        assert_eq!(BitsetKind::Bool8.as_bool(0), Some(false));
        assert_eq!(BitsetKind::Bool8.as_bool(7), Some(true));
    }

    #[test]
    fn test_apply_scale() {
        let mut el = scalar("temp", 6);
        el.scale = 0.5;
        el.offset = -20;
        assert_eq!(el.apply_scale(100.0), 30.0);
        let unscaled = scalar("raw", 6);
        assert_eq!(unscaled.apply_scale(100.0), 100.0);
    }
}
