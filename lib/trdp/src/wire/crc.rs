//! Frame check sequences.
//!
//! Two table-driven checksums ride in every stack: the FCS-32 used by the
//! frame headers (IEEE 802.3 polynomial, reflected, seeded all-ones and
//! inverted on output) and the SC-32 used by SDTv2 safe payloads
//! (left-shifting, seeded with the SID, no output inversion).

use lazy_static::lazy_static;

/// Seed for a fresh header FCS computation.
pub const FCS_SEED: u32 = 0xFFFF_FFFF;

const FCS_POLY: u32 = 0xEDB8_8320;
const SC_POLY: u32 = 0xF4AC_FB13;

lazy_static! {
    static ref FCSTAB: [u32; 256] = {
        let mut tab = [0u32; 256];
        for n in 0..256usize {
            let mut c = n as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { FCS_POLY ^ (c >> 1) } else { c >> 1 };
            }
            tab[n] = c;
        }
        tab
    };
    static ref SCTAB: [u32; 256] = {
        let mut tab = [0u32; 256];
        for n in 0..256usize {
            let mut c = (n as u32) << 24;
            for _ in 0..8 {
                c = if c & 0x8000_0000 != 0 { (c << 1) ^ SC_POLY } else { c << 1 };
            }
            tab[n] = c;
        }
        tab
    };
}

/// FCS-32 over `buf`, continuing from `fcs` (pass [`FCS_SEED`] for a fresh
/// run). The result is already inverted and is what goes on the wire.
pub fn fcs32(buf: &[u8], fcs: u32) -> u32 {
    let mut fcs = fcs;
    for &byte in buf {
        fcs = (fcs >> 8) ^ FCSTAB[((fcs ^ u32::from(byte)) & 0xff) as usize];
    }
    !fcs
}

/// SC-32 over `buf` seeded with the 32-bit safe-data identifier.
pub fn sc32(buf: &[u8], sid: u32) -> u32 {
    let mut sc = sid;
    for &byte in buf {
        sc = SCTAB[(((sc >> 24) ^ u32::from(byte)) & 0xff) as usize] ^ (sc << 8);
    }
    sc
}
