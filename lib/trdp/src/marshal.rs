//! Marshalling layer.
//!
//! Translates between the application's host buffer (native byte order,
//! elements at their natural alignment, C-struct style) and the wire buffer
//! (big-endian unless an element is tagged little, packed with no padding).
//! The walk is driven entirely by the dataset dictionary; variable arrays
//! take their runtime length from the value of the immediately preceding
//! integer scalar, on whichever side currently holds the data.
//!
//! Failures never report a partial length, but partial writes into the
//! destination are allowed: a caller seeing an error must treat the
//! destination buffer as garbage.

use crate::dict::{DatasetRef, Dictionary, Element, Primitive, TypeId};
use crate::error::{Result, TrdpError};
use byteorder::{BigEndian, ByteOrder, LittleEndian, NativeEndian};
use crate::wire::header::MAX_PD_PAYLOAD;

#[inline]
fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// Marshals `host` into `wire` according to the dataset layout and returns
/// the number of wire bytes produced.
pub fn marshal(
    dict: &Dictionary,
    dataset_id: TypeId,
    host: &[u8],
    wire: &mut [u8],
    cache: &mut Option<DatasetRef>,
) -> Result<usize> {
    let ds = dict.resolve(dataset_id, cache)?;
    let mut walk = ToWire { dict, host, wire, host_off: 0, wire_off: 0 };
    walk.dataset(ds.id)?;
    Ok(walk.wire_off)
}

/// Unmarshals `wire` into `host` and returns `(host_bytes, wire_bytes)`
/// actually used. The caller compares the consumed wire bytes against the
/// frame's dataset length to catch schema drift.
pub fn unmarshal(
    dict: &Dictionary,
    dataset_id: TypeId,
    wire: &[u8],
    host: &mut [u8],
    cache: &mut Option<DatasetRef>,
) -> Result<(usize, usize)> {
    let ds = dict.resolve(dataset_id, cache)?;
    let mut walk = ToHost { dict, wire, host, host_off: 0, wire_off: 0 };
    walk.dataset(ds.id)?;
    Ok((walk.host_off, walk.wire_off))
}

/// Computes the wire size the given host buffer would marshal to, without
/// moving any data.
pub fn wire_size(
    dict: &Dictionary,
    dataset_id: TypeId,
    host: &[u8],
    cache: &mut Option<DatasetRef>,
) -> Result<usize> {
    let ds = dict.resolve(dataset_id, cache)?;
    let mut walk = Measure { dict, host: Some(host), host_off: 0, wire_off: 0 };
    walk.dataset(ds.id)?;
    Ok(walk.wire_off)
}

/// The smallest wire size any value of the dataset can have, counting
/// variable arrays as empty. A decode must use actual counts.
pub fn min_wire_size(dict: &Dictionary, dataset_id: TypeId) -> Result<usize> {
    let ds = dict
        .dataset(dataset_id)
        .ok_or_else(|| TrdpError::structure(format!("unknown dataset {}", dataset_id)))?;
    let mut walk = Measure { dict, host: None, host_off: 0, wire_off: 0 };
    walk.dataset(ds.id)?;
    Ok(walk.wire_off)
}

/// Host-side alignment of a dataset: the strictest alignment of any element
/// reachable from it.
fn dataset_align(dict: &Dictionary, dataset_id: TypeId) -> usize {
    let ds = match dict.dataset(dataset_id) {
        Some(ds) => ds,
        None => return 1,
    };
    ds.elements
        .iter()
        .map(|el| match el.primitive() {
            Some(prim) => prim.host_align(),
            None => dataset_align(dict, el.type_id),
        })
        .max()
        .unwrap_or(1)
}

fn resolve_count(el: &Element, last_int: Option<u64>, ds_id: TypeId) -> Result<usize> {
    if el.is_variable() {
        let count = last_int.ok_or_else(|| {
            TrdpError::structure(format!(
                "dataset {} variable array '{}' has no length value",
                ds_id, el.name
            ))
        })?;
        if count > MAX_PD_PAYLOAD as u64 * 64 {
            return Err(TrdpError::structure(format!(
                "dataset {} variable array '{}' length {} is implausible",
                ds_id, el.name, count
            )));
        }
        Ok(count as usize)
    } else {
        Ok(el.cardinality as usize)
    }
}

macro_rules! write_ordered {
    ($fn:ident, $el:expr, $buf:expr, $val:expr) => {
        match $el.order {
            crate::dict::WireOrder::Big => BigEndian::$fn($buf, $val),
            crate::dict::WireOrder::Little => LittleEndian::$fn($buf, $val),
        }
    };
}

macro_rules! read_ordered {
    ($fn:ident, $el:expr, $buf:expr) => {
        match $el.order {
            crate::dict::WireOrder::Big => BigEndian::$fn($buf),
            crate::dict::WireOrder::Little => LittleEndian::$fn($buf),
        }
    };
}

struct ToWire<'a> {
    dict: &'a Dictionary,
    host: &'a [u8],
    wire: &'a mut [u8],
    host_off: usize,
    wire_off: usize,
}

impl<'a> ToWire<'a> {
    fn dataset(&mut self, dataset_id: TypeId) -> Result<()> {
        let ds = self
            .dict
            .dataset(dataset_id)
            .ok_or_else(|| TrdpError::structure(format!("unknown dataset {}", dataset_id)))?;

        let mut last_int: Option<u64> = None;
        for el in &ds.elements {
            let count = resolve_count(el, last_int, ds.id)?;
            last_int = None;

            match el.primitive() {
                Some(prim) => {
                    self.host_off = align_up(self.host_off, prim.host_align());
                    for _ in 0..count {
                        let value = self.primitive(el, prim)?;
                        if el.cardinality == 1 && prim.is_integer() {
                            last_int = value;
                        }
                    }
                }
                None => {
                    let align = dataset_align(self.dict, el.type_id);
                    for _ in 0..count {
                        self.host_off = align_up(self.host_off, align);
                        self.dataset(el.type_id)?;
                        self.host_off = align_up(self.host_off, align);
                    }
                }
            }
        }
        Ok(())
    }

    /// Moves one primitive value host -> wire; returns the value for
    /// integer kinds so the caller can track variable-array lengths.
    fn primitive(&mut self, el: &Element, prim: Primitive) -> Result<Option<u64>> {
        let hw = prim.host_width();
        let ww = prim.wire_width();
        if self.host_off + hw > self.host.len() {
            return Err(TrdpError::BufferOverflow);
        }
        if self.wire_off + ww > self.wire.len() {
            return Err(TrdpError::BufferOverflow);
        }
        let src = &self.host[self.host_off..self.host_off + hw];
        let dst = &mut self.wire[self.wire_off..self.wire_off + ww];

        let mut int_value = None;
        match prim {
            Primitive::Bool8 | Primitive::Char8 | Primitive::Int8 | Primitive::UInt8 => {
                dst[0] = src[0];
                int_value = Some(u64::from(src[0]));
            }
            Primitive::Utf16 | Primitive::Int16 | Primitive::UInt16 => {
                let v = NativeEndian::read_u16(src);
                write_ordered!(write_u16, el, dst, v);
                int_value = Some(u64::from(v));
            }
            Primitive::Int32
            | Primitive::UInt32
            | Primitive::Real32
            | Primitive::TimeDate32
            | Primitive::Sc32 => {
                let v = NativeEndian::read_u32(src);
                write_ordered!(write_u32, el, dst, v);
                int_value = Some(u64::from(v));
            }
            Primitive::Int64 | Primitive::UInt64 | Primitive::Real64 => {
                let v = NativeEndian::read_u64(src);
                write_ordered!(write_u64, el, dst, v);
                int_value = Some(v);
            }
            Primitive::TimeDate48 => {
                // 32-bit seconds + 16-bit ticks, two host fields.
                BigEndian::write_u32(&mut dst[0..4], NativeEndian::read_u32(&src[0..4]));
                BigEndian::write_u16(&mut dst[4..6], NativeEndian::read_u16(&src[4..6]));
            }
            Primitive::TimeDate64 => {
                // 32-bit seconds + 32-bit microseconds, two host fields.
                BigEndian::write_u32(&mut dst[0..4], NativeEndian::read_u32(&src[0..4]));
                BigEndian::write_u32(&mut dst[4..8], NativeEndian::read_u32(&src[4..8]));
            }
        }
        self.host_off += hw;
        self.wire_off += ww;
        Ok(int_value)
    }
}

struct ToHost<'a> {
    dict: &'a Dictionary,
    wire: &'a [u8],
    host: &'a mut [u8],
    host_off: usize,
    wire_off: usize,
}

impl<'a> ToHost<'a> {
    fn dataset(&mut self, dataset_id: TypeId) -> Result<()> {
        let ds = self
            .dict
            .dataset(dataset_id)
            .ok_or_else(|| TrdpError::structure(format!("unknown dataset {}", dataset_id)))?;

        let mut last_int: Option<u64> = None;
        for el in &ds.elements {
            let count = resolve_count(el, last_int, ds.id)?;
            last_int = None;

            match el.primitive() {
                Some(prim) => {
                    self.host_off = align_up(self.host_off, prim.host_align());
                    for _ in 0..count {
                        let value = self.primitive(el, prim)?;
                        if el.cardinality == 1 && prim.is_integer() {
                            last_int = value;
                        }
                    }
                }
                None => {
                    let align = dataset_align(self.dict, el.type_id);
                    for _ in 0..count {
                        self.host_off = align_up(self.host_off, align);
                        self.dataset(el.type_id)?;
                        self.host_off = align_up(self.host_off, align);
                    }
                }
            }
        }
        Ok(())
    }

    fn primitive(&mut self, el: &Element, prim: Primitive) -> Result<Option<u64>> {
        let hw = prim.host_width();
        let ww = prim.wire_width();
        if self.wire_off + ww > self.wire.len() {
            return Err(TrdpError::BufferOverflow);
        }
        if self.host_off + hw > self.host.len() {
            return Err(TrdpError::BufferOverflow);
        }
        let src = &self.wire[self.wire_off..self.wire_off + ww];
        let dst = &mut self.host[self.host_off..self.host_off + hw];

        let mut int_value = None;
        match prim {
            Primitive::Bool8 | Primitive::Char8 | Primitive::Int8 | Primitive::UInt8 => {
                dst[0] = src[0];
                int_value = Some(u64::from(src[0]));
            }
            Primitive::Utf16 | Primitive::Int16 | Primitive::UInt16 => {
                let v = read_ordered!(read_u16, el, src);
                NativeEndian::write_u16(dst, v);
                int_value = Some(u64::from(v));
            }
            Primitive::Int32
            | Primitive::UInt32
            | Primitive::Real32
            | Primitive::TimeDate32
            | Primitive::Sc32 => {
                let v = read_ordered!(read_u32, el, src);
                NativeEndian::write_u32(dst, v);
                int_value = Some(u64::from(v));
            }
            Primitive::Int64 | Primitive::UInt64 | Primitive::Real64 => {
                let v = read_ordered!(read_u64, el, src);
                NativeEndian::write_u64(dst, v);
                int_value = Some(v);
            }
            Primitive::TimeDate48 => {
                NativeEndian::write_u32(&mut dst[0..4], BigEndian::read_u32(&src[0..4]));
                NativeEndian::write_u16(&mut dst[4..6], BigEndian::read_u16(&src[4..6]));
                dst[6] = 0;
                dst[7] = 0;
            }
            Primitive::TimeDate64 => {
                NativeEndian::write_u32(&mut dst[0..4], BigEndian::read_u32(&src[0..4]));
                NativeEndian::write_u32(&mut dst[4..8], BigEndian::read_u32(&src[4..8]));
            }
        }
        self.host_off += hw;
        self.wire_off += ww;
        Ok(int_value)
    }
}

struct Measure<'a> {
    dict: &'a Dictionary,
    /// With a host buffer, variable counts come from it; without one, they
    /// count as zero (minimum size).
    host: Option<&'a [u8]>,
    host_off: usize,
    wire_off: usize,
}

impl<'a> Measure<'a> {
    fn dataset(&mut self, dataset_id: TypeId) -> Result<()> {
        let ds = self
            .dict
            .dataset(dataset_id)
            .ok_or_else(|| TrdpError::structure(format!("unknown dataset {}", dataset_id)))?;

        let mut last_int: Option<u64> = None;
        for el in &ds.elements {
            let count = if el.is_variable() && self.host.is_none() {
                0
            } else {
                resolve_count(el, last_int, ds.id)?
            };
            last_int = None;

            match el.primitive() {
                Some(prim) => {
                    self.host_off = align_up(self.host_off, prim.host_align());
                    for _ in 0..count {
                        if el.cardinality == 1 && prim.is_integer() {
                            last_int = self.read_int(prim)?;
                        }
                        self.host_off += prim.host_width();
                        self.wire_off += prim.wire_width();
                    }
                }
                None => {
                    let align = dataset_align(self.dict, el.type_id);
                    for _ in 0..count {
                        self.host_off = align_up(self.host_off, align);
                        self.dataset(el.type_id)?;
                        self.host_off = align_up(self.host_off, align);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_int(&self, prim: Primitive) -> Result<Option<u64>> {
        let host = match self.host {
            Some(host) => host,
            None => return Ok(None),
        };
        let hw = prim.host_width();
        if self.host_off + hw > host.len() {
            return Err(TrdpError::BufferOverflow);
        }
        let src = &host[self.host_off..self.host_off + hw];
        Ok(Some(match hw {
            1 => u64::from(src[0]),
            2 => u64::from(NativeEndian::read_u16(src)),
            4 => u64::from(NativeEndian::read_u32(src)),
            _ => NativeEndian::read_u64(src),
        }))
    }
}
