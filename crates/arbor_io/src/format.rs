//! # Snapshot File Format
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------
//!      0     4  magic "ARBS"
//!      4     4  version (u32)
//!      8     1  kind (0 = full, 1 = quick)
//!      9     1  layout (0 = combined, 1 = per-process)
//!     10     2  reserved (zero)
//!     12     8  simulated time (f64)
//!     20     8  body count n (u64)
//!     28    24  particle class counts (3 x u64)
//!     52     4  writer rank (u32)
//!     56     4  process count (u32)
//!     60  16*n  positions (x, y, z, mass as f32)
//!         16*n  velocities (x, y, z, 0 as f32)
//!          8*n  ids (u64)
//!            4  CRC-32 of every preceding byte
//! ```
//!
//! All fields are little-endian. Files are written next to their final name
//! with a `.tmp` suffix, synced, then renamed into place.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use arbor_shared::{BodyId, Real4, SnapshotKind};
use bytemuck::Pod;

use crate::error::{IoError, IoResult};
use crate::snapshot::SnapshotData;

/// File magic.
pub const MAGIC: [u8; 4] = *b"ARBS";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes before the first array.
pub const HEADER_LEN: usize = 60;

const TRAILER_LEN: usize = 4;
const BYTES_PER_BODY: usize = 16 + 16 + 8;

/// How a snapshot is spread over files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileLayout {
    /// One file holds every rank's particles.
    Combined = 0,
    /// Each rank writes its own file.
    PerProcess = 1,
}

impl FileLayout {
    /// Converts from u8.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Combined),
            1 => Some(Self::PerProcess),
            _ => None,
        }
    }
}

/// Fixed-size file header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SnapshotHeader {
    /// Full or quick.
    pub kind: SnapshotKind,
    /// Combined or per-process.
    pub layout: FileLayout,
    /// Simulated time.
    pub t_current: f64,
    /// Bodies in this file.
    pub n_bodies: u64,
    /// Particle class counts.
    pub class_counts: [u64; 3],
    /// Rank that wrote the file.
    pub rank: u32,
    /// Processes in the run.
    pub nprocs: u32,
}

impl SnapshotHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.push(self.kind as u8);
        out.push(self.layout as u8);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.t_current.to_le_bytes());
        out.extend_from_slice(&self.n_bodies.to_le_bytes());
        for count in self.class_counts {
            out.extend_from_slice(&count.to_le_bytes());
        }
        out.extend_from_slice(&self.rank.to_le_bytes());
        out.extend_from_slice(&self.nprocs.to_le_bytes());
    }

    fn decode(bytes: &[u8], path: &Path) -> IoResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(IoError::Truncated {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(IoError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let mut cursor = Cursor::new(&bytes[4..HEADER_LEN]);
        let version = cursor.u32();
        if version != FORMAT_VERSION {
            return Err(IoError::UnsupportedVersion { version });
        }
        let kind = SnapshotKind::from_u8(cursor.u8())
            .ok_or_else(|| IoError::Inconsistent("unknown snapshot kind".to_string()))?;
        let layout = FileLayout::from_u8(cursor.u8())
            .ok_or_else(|| IoError::Inconsistent("unknown file layout".to_string()))?;
        let _reserved = cursor.u16();
        Ok(Self {
            kind,
            layout,
            t_current: f64::from_bits(cursor.u64()),
            n_bodies: cursor.u64(),
            class_counts: [cursor.u64(), cursor.u64(), cursor.u64()],
            rank: cursor.u32(),
            nprocs: cursor.u32(),
        })
    }
}

/// Little-endian reader over a slice whose length was already checked.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

fn pod_vec<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

/// A decoded snapshot file.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotFile {
    /// Header fields.
    pub header: SnapshotHeader,
    /// Positions with mass.
    pub positions: Vec<Real4>,
    /// Velocities.
    pub velocities: Vec<Real4>,
    /// Identifiers.
    pub ids: Vec<BodyId>,
}

impl SnapshotFile {
    /// Converts into a dataset, keeping kind, time and class counts.
    #[must_use]
    pub fn into_snapshot(self) -> SnapshotData {
        SnapshotData::from_parts(
            self.header.kind,
            self.header.t_current,
            self.header.class_counts,
            self.positions,
            self.velocities,
            self.ids,
        )
    }
}

/// Encodes a complete file: header, arrays and CRC trailer.
#[must_use]
pub fn encode_file(
    header: &SnapshotHeader,
    positions: &[Real4],
    velocities: &[Real4],
    ids: &[BodyId],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + positions.len() * BYTES_PER_BODY + TRAILER_LEN);
    header.encode(&mut out);
    encode_arrays(&mut out, positions, velocities, ids);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn encode_arrays(out: &mut Vec<u8>, positions: &[Real4], velocities: &[Real4], ids: &[BodyId]) {
    for p in positions {
        for c in [p.x, p.y, p.z, p.w] {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }
    for v in velocities {
        for c in [v.x, v.y, v.z, v.w] {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }
    for id in ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
}

fn decode_arrays(bytes: &[u8], n: usize) -> (Vec<Real4>, Vec<Real4>, Vec<BodyId>) {
    let (positions, rest) = bytes.split_at(n * 16);
    let (velocities, ids) = rest.split_at(n * 16);
    let positions = pod_vec::<[u8; 16]>(positions)
        .into_iter()
        .map(real4_from_le)
        .collect();
    let velocities = pod_vec::<[u8; 16]>(velocities)
        .into_iter()
        .map(real4_from_le)
        .collect();
    let ids = pod_vec::<[u8; 8]>(&ids[..n * 8])
        .into_iter()
        .map(u64::from_le_bytes)
        .collect();
    (positions, velocities, ids)
}

fn real4_from_le(raw: [u8; 16]) -> Real4 {
    let mut cursor = Cursor::new(&raw);
    Real4::new(
        f32::from_bits(cursor.u32()),
        f32::from_bits(cursor.u32()),
        f32::from_bits(cursor.u32()),
        f32::from_bits(cursor.u32()),
    )
}

/// Decodes and verifies a complete file image.
pub fn decode_file(bytes: &[u8], path: &Path) -> IoResult<SnapshotFile> {
    let header = SnapshotHeader::decode(bytes, path)?;
    let n = usize::try_from(header.n_bodies)
        .map_err(|_| IoError::Inconsistent(format!("body count {}", header.n_bodies)))?;
    let needed = n
        .checked_mul(BYTES_PER_BODY)
        .and_then(|b| b.checked_add(HEADER_LEN + TRAILER_LEN))
        .ok_or_else(|| IoError::Inconsistent(format!("body count {n}")))?;
    if bytes.len() < needed {
        return Err(IoError::Truncated {
            needed,
            available: bytes.len(),
        });
    }

    let body_end = needed - TRAILER_LEN;
    let stored = u32::from_le_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    let computed = crc32fast::hash(&bytes[..body_end]);
    if stored != computed {
        return Err(IoError::Checksum { stored, computed });
    }

    let (positions, velocities, ids) = decode_arrays(&bytes[HEADER_LEN..body_end], n);
    Ok(SnapshotFile {
        header,
        positions,
        velocities,
        ids,
    })
}

/// Reads and verifies a snapshot file.
pub fn read_file(path: &Path) -> IoResult<SnapshotFile> {
    let bytes = fs::read(path).map_err(|e| IoError::file("read", path, e))?;
    decode_file(&bytes, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes `bytes` to `path` through a synced temporary file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> IoResult<()> {
    let tmp = temp_path(path);
    let mut file = File::create(&tmp).map_err(|e| IoError::file("create", &tmp, e))?;
    file.write_all(bytes)
        .map_err(|e| IoError::file("write", &tmp, e))?;
    file.sync_all().map_err(|e| IoError::file("sync", &tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| IoError::file("rename", path, e))
}

/// One rank's contribution to a combined file, as shipped to the root.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    /// Kind of the snapshot it belongs to.
    pub kind: SnapshotKind,
    /// Simulated time it was captured at.
    pub t_current: f64,
    /// Class counts of this rank.
    pub class_counts: [u64; 3],
    /// Positions.
    pub positions: Vec<Real4>,
    /// Velocities.
    pub velocities: Vec<Real4>,
    /// Identifiers.
    pub ids: Vec<BodyId>,
}

const SECTION_HEADER_LEN: usize = 1 + 8 + 24 + 8;

/// Encodes a rank's section: kind, time, class counts, n, arrays.
#[must_use]
pub fn encode_section(snapshot: &SnapshotData) -> Vec<u8> {
    let n = snapshot.n_bodies();
    let mut out = Vec::with_capacity(SECTION_HEADER_LEN + n * BYTES_PER_BODY);
    out.push(snapshot.kind() as u8);
    out.extend_from_slice(&snapshot.t_current().to_le_bytes());
    for count in snapshot.class_counts() {
        out.extend_from_slice(&count.to_le_bytes());
    }
    out.extend_from_slice(&(n as u64).to_le_bytes());
    encode_arrays(
        &mut out,
        snapshot.positions(),
        snapshot.velocities(),
        snapshot.ids(),
    );
    out
}

/// Decodes a section produced by [`encode_section`].
pub fn decode_section(bytes: &[u8]) -> IoResult<Section> {
    if bytes.len() < SECTION_HEADER_LEN {
        return Err(IoError::Truncated {
            needed: SECTION_HEADER_LEN,
            available: bytes.len(),
        });
    }
    let mut cursor = Cursor::new(&bytes[..SECTION_HEADER_LEN]);
    let kind = SnapshotKind::from_u8(cursor.u8())
        .ok_or_else(|| IoError::Inconsistent("unknown snapshot kind".to_string()))?;
    let t_current = f64::from_bits(cursor.u64());
    let class_counts = [cursor.u64(), cursor.u64(), cursor.u64()];
    let n = usize::try_from(cursor.u64())
        .map_err(|_| IoError::Inconsistent("section body count".to_string()))?;
    let needed = n
        .checked_mul(BYTES_PER_BODY)
        .and_then(|b| b.checked_add(SECTION_HEADER_LEN))
        .ok_or_else(|| IoError::Inconsistent(format!("section body count {n}")))?;
    if bytes.len() != needed {
        return Err(IoError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    let (positions, velocities, ids) = decode_arrays(&bytes[SECTION_HEADER_LEN..], n);
    Ok(Section {
        kind,
        t_current,
        class_counts,
        positions,
        velocities,
        ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(n: u64) -> SnapshotHeader {
        SnapshotHeader {
            kind: SnapshotKind::Full,
            layout: FileLayout::Combined,
            t_current: 2.5,
            n_bodies: n,
            class_counts: [n, 0, 0],
            rank: 0,
            nprocs: 1,
        }
    }

    fn arrays(n: usize) -> (Vec<Real4>, Vec<Real4>, Vec<BodyId>) {
        (
            (0..n).map(|i| Real4::position(i as f32, -1.0, 0.5, 0.25)).collect(),
            (0..n).map(|i| Real4::velocity(0.0, i as f32, 1.0)).collect(),
            (0..n as u64).map(|i| i * 7).collect(),
        )
    }

    #[test]
    fn test_header_is_fixed_size() {
        let mut out = Vec::new();
        header(3).encode(&mut out);
        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(&out[..4], b"ARBS");
    }

    #[test]
    fn test_file_decodes_to_same_arrays() {
        let (p, v, ids) = arrays(5);
        let bytes = encode_file(&header(5), &p, &v, &ids);
        assert_eq!(bytes.len(), HEADER_LEN + 5 * BYTES_PER_BODY + TRAILER_LEN);

        let file = decode_file(&bytes, Path::new("mem")).unwrap();
        assert_eq!(file.header, header(5));
        assert_eq!(file.positions, p);
        assert_eq!(file.velocities, v);
        assert_eq!(file.ids, ids);
    }

    #[test]
    fn test_corruption_detected() {
        let (p, v, ids) = arrays(2);
        let mut bytes = encode_file(&header(2), &p, &v, &ids);
        bytes[HEADER_LEN + 3] ^= 0xff;
        assert!(matches!(
            decode_file(&bytes, Path::new("mem")),
            Err(IoError::Checksum { .. })
        ));
    }

    #[test]
    fn test_truncation_and_magic() {
        let (p, v, ids) = arrays(2);
        let bytes = encode_file(&header(2), &p, &v, &ids);
        assert!(matches!(
            decode_file(&bytes[..bytes.len() - 1], Path::new("mem")),
            Err(IoError::Truncated { .. })
        ));

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(
            decode_file(&bad, Path::new("mem")),
            Err(IoError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap__00002.5000");
        write_atomic(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_section_keeps_metadata() {
        let (p, v, ids) = arrays(3);
        let snapshot = SnapshotData::new(1.25, p, v, ids).unwrap();
        let section = decode_section(&encode_section(&snapshot)).unwrap();
        assert_eq!(section.kind, SnapshotKind::Full);
        assert!((section.t_current - 1.25).abs() < f64::EPSILON);
        assert_eq!(section.ids, snapshot.ids());
        assert!(decode_section(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_section_with_absurd_count_is_rejected() {
        let (p, v, ids) = arrays(2);
        let mut bytes = encode_section(&SnapshotData::new(0.5, p, v, ids).unwrap());
        let count = SECTION_HEADER_LEN - 8..SECTION_HEADER_LEN;
        bytes[count.clone()].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode_section(&bytes).is_err());

        // A count whose byte length wraps around must not pass either.
        let wrapping = (u64::MAX / BYTES_PER_BODY as u64) + 1;
        bytes[count].copy_from_slice(&wrapping.to_le_bytes());
        assert!(decode_section(&bytes).is_err());
    }
}
