//! Btree node on-disk format.
//!
//! A node occupies one bucket and holds a sequence of bset records: the
//! first record carries the node header (btree id, level, the node's own
//! key), continuation records append later sets. Every record is
//! checksummed and stamped with the image's `node_seq`, so records left
//! over from an earlier image of the same bucket never parse.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error};
use rand::Rng;

use crate::bkey::{Bkey, Bpos, BtreeId, Bval, InodeVal};
use crate::bset::{Bset, NodeKeys};
use crate::btree::{BtreeNode, NodeData, NodeFlags};
use crate::errcode::{ErrCode, Result};
use crate::extents::{Crc, ExtentVal, Ptr};
use crate::io::{Bio, SECTOR_SHIFT, SECTOR_SIZE};
use crate::super_block::CacheSet;
use crate::util::crc64;

const NODE_MAGIC: u64 = 0x6263_6e6f_6465_3031; // "bcnode01"
const BSET_MAGIC: u64 = 0x6263_7365_7430_3031; // "bcset001"

const TAG_DELETED: u8 = 0;
const TAG_CHECK: u8 = 1;
const TAG_EXTENT: u8 = 2;
const TAG_INODE: u8 = 3;
const TAG_BTREE_PTR: u8 = 4;

const VAL_FLAG_DIRTY: u8 = 1 << 0;
const VAL_FLAG_CSUM: u8 = 1 << 1;

pub fn encode_bkey(buf: &mut Vec<u8>, k: &Bkey) {
    buf.write_u64::<LittleEndian>(k.p.inode).unwrap();
    buf.write_u64::<LittleEndian>(k.p.offset).unwrap();
    buf.write_u32::<LittleEndian>(k.size).unwrap();
    match &k.val {
        Bval::Deleted => buf.push(TAG_DELETED),
        Bval::Check => buf.push(TAG_CHECK),
        Bval::Extent(e) | Bval::BtreePtr(e) => {
            buf.push(if matches!(k.val, Bval::Extent(_)) {
                TAG_EXTENT
            } else {
                TAG_BTREE_PTR
            });
            let mut flags = 0u8;
            if e.dirty {
                flags |= VAL_FLAG_DIRTY;
            }
            if e.crc.is_some() {
                flags |= VAL_FLAG_CSUM;
            }
            buf.push(flags);
            buf.push(e.ptrs.len() as u8);
            for p in &e.ptrs {
                buf.push(p.dev);
                buf.push(p.gen);
                buf.write_u64::<LittleEndian>(p.offset).unwrap();
            }
            if let Some(crc) = &e.crc {
                buf.write_u64::<LittleEndian>(crc.csum).unwrap();
            }
        }
        Bval::Inode(i) => {
            buf.push(TAG_INODE);
            buf.write_u64::<LittleEndian>(i.i_size).unwrap();
            buf.extend_from_slice(&i.i_label);
        }
    }
}

pub fn decode_bkey(cur: &mut Cursor<&[u8]>) -> Result<Bkey> {
    let bad = |_| ErrCode::IO;
    let inode = cur.read_u64::<LittleEndian>().map_err(bad)?;
    let offset = cur.read_u64::<LittleEndian>().map_err(bad)?;
    let size = cur.read_u32::<LittleEndian>().map_err(bad)?;
    let tag = cur.read_u8().map_err(bad)?;
    let p = Bpos { inode, offset };

    let val = match tag {
        TAG_DELETED => Bval::Deleted,
        TAG_CHECK => Bval::Check,
        TAG_EXTENT | TAG_BTREE_PTR => {
            let flags = cur.read_u8().map_err(bad)?;
            let nptrs = cur.read_u8().map_err(bad)?;
            let mut e = ExtentVal::new();
            e.dirty = flags & VAL_FLAG_DIRTY != 0;
            for _ in 0..nptrs {
                let dev = cur.read_u8().map_err(bad)?;
                let gen = cur.read_u8().map_err(bad)?;
                let off = cur.read_u64::<LittleEndian>().map_err(bad)?;
                e.ptrs.push(Ptr { dev, gen, offset: off });
            }
            if flags & VAL_FLAG_CSUM != 0 {
                e.crc = Some(Crc {
                    csum: cur.read_u64::<LittleEndian>().map_err(bad)?,
                });
            }
            if tag == TAG_EXTENT {
                Bval::Extent(e)
            } else {
                Bval::BtreePtr(e)
            }
        }
        TAG_INODE => {
            let i_size = cur.read_u64::<LittleEndian>().map_err(bad)?;
            let mut i_label = [0u8; 32];
            std::io::Read::read_exact(cur, &mut i_label).map_err(bad)?;
            Bval::Inode(InodeVal { i_size, i_label })
        }
        _ => return Err(ErrCode::IO),
    };

    Ok(Bkey { p, size, val })
}

fn btree_id_byte(id: BtreeId) -> u8 {
    id.index() as u8
}

/// Serialize one record. The payload is checksummed; the header is
/// `magic, csum, node_seq, payload_len`.
fn encode_record(
    magic: u64,
    node_seq: u64,
    header: Option<(&Bkey, BtreeId, u8)>,
    sets: &[&Bset],
) -> Vec<u8> {
    let mut payload = Vec::new();
    if let Some((key, btree_id, level)) = header {
        payload.push(btree_id_byte(btree_id));
        payload.push(level);
        encode_bkey(&mut payload, key);
    }
    payload.write_u32::<LittleEndian>(sets.len() as u32).unwrap();
    for set in sets {
        payload
            .write_u32::<LittleEndian>(set.keys.len() as u32)
            .unwrap();
        for k in &set.keys {
            encode_bkey(&mut payload, k);
        }
    }

    let mut buf = Vec::with_capacity(32 + payload.len());
    buf.write_u64::<LittleEndian>(magic).unwrap();
    buf.write_u64::<LittleEndian>(crc64(&payload)).unwrap();
    buf.write_u64::<LittleEndian>(node_seq).unwrap();
    buf.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    buf.extend_from_slice(&payload);

    // Pad to a sector boundary.
    let rem = buf.len() % SECTOR_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + SECTOR_SIZE - rem, 0);
    }
    buf
}

struct Record {
    sets: Vec<Bset>,
    header: Option<(Bkey, BtreeId, u8)>,
    sectors: u32,
}

fn decode_record(buf: &[u8], expect_magic: u64, expect_seq: Option<u64>) -> Result<Option<Record>> {
    if buf.len() < 28 {
        return Ok(None);
    }
    let mut cur = Cursor::new(buf);
    let magic = cur.read_u64::<LittleEndian>().map_err(|_| ErrCode::IO)?;
    if magic != expect_magic {
        return Ok(None);
    }
    let csum = cur.read_u64::<LittleEndian>().map_err(|_| ErrCode::IO)?;
    let node_seq = cur.read_u64::<LittleEndian>().map_err(|_| ErrCode::IO)?;
    let len = cur.read_u32::<LittleEndian>().map_err(|_| ErrCode::IO)? as usize;
    if let Some(seq) = expect_seq {
        if node_seq != seq {
            return Ok(None);
        }
    }
    if 28 + len > buf.len() {
        return Err(ErrCode::IO);
    }
    let payload = &buf[28..28 + len];
    if crc64(payload) != csum {
        debug!("btree node record: bad checksum");
        return Err(ErrCode::IO);
    }

    let mut cur = Cursor::new(payload);
    let header = if expect_magic == NODE_MAGIC {
        let id = cur.read_u8().map_err(|_| ErrCode::IO)?;
        let level = cur.read_u8().map_err(|_| ErrCode::IO)?;
        if id as usize >= crate::bkey::BTREE_ID_NR {
            return Err(ErrCode::IO);
        }
        let key = decode_bkey(&mut cur)?;
        Some((key, BtreeId::from_index(id as usize), level))
    } else {
        None
    };

    let nsets = cur.read_u32::<LittleEndian>().map_err(|_| ErrCode::IO)?;
    let mut sets = Vec::with_capacity(nsets as usize);
    for _ in 0..nsets {
        let nkeys = cur.read_u32::<LittleEndian>().map_err(|_| ErrCode::IO)?;
        let mut keys = Vec::with_capacity(nkeys as usize);
        for _ in 0..nkeys {
            keys.push(decode_bkey(&mut cur)?);
        }
        sets.push(Bset { keys });
    }

    let total = 28 + len;
    let sectors = ((total + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32;
    Ok(Some(Record {
        sets,
        header,
        sectors,
    }))
}

/// Write a node's unwritten sets to its bucket. Falls back to a compacted
/// full rewrite when the append would overflow the bucket. Caller holds the
/// node write-locked (or owns it exclusively on the reap path).
pub fn write_node(cs: &CacheSet, node: &BtreeNode) -> Result<()> {
    let meta = node.meta.lock().clone();
    let Some(ptr) = meta.key.btree_ptr().and_then(|e| e.first_ptr()).copied() else {
        return Err(ErrCode::Inconsistent);
    };
    let Some(ca) = cs.cache(ptr.dev) else {
        error!("btree node write: pointer to missing device {}", ptr.dev);
        cs.set_inconsistent();
        return Err(ErrCode::Inconsistent);
    };

    node.set_flag(NodeFlags::WRITE_IN_FLIGHT);
    node.clear_flag(NodeFlags::DIRTY);

    let mut guard = node.data.write();
    let Some(d) = guard.as_mut() else {
        node.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
        return Ok(());
    };

    let bucket_sectors = ca.bucket_size;
    let mut full_rewrite = d.written == 0;

    let buf = if !full_rewrite {
        let unwritten: Vec<&Bset> = d.keys.sets[d.keys.written_sets..].iter().collect();
        if unwritten.iter().all(|s| s.keys.is_empty()) {
            node.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
            return Ok(());
        }
        let buf = encode_record(BSET_MAGIC, d.node_seq, None, &unwritten);
        if d.written + (buf.len() >> SECTOR_SHIFT) as u32 > bucket_sectors {
            full_rewrite = true;
        }
        buf
    } else {
        Vec::new()
    };

    let (buf, write_at) = if full_rewrite {
        d.keys.sort_all();
        d.node_seq = rand::thread_rng().gen();
        let sets: Vec<&Bset> = d.keys.sets.iter().collect();
        let buf = encode_record(
            NODE_MAGIC,
            d.node_seq,
            Some((&meta.key, meta.btree_id, meta.level)),
            &sets,
        );
        if (buf.len() >> SECTOR_SHIFT) as u32 > bucket_sectors {
            error!("btree node image exceeds bucket size");
            cs.set_inconsistent();
            node.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
            return Err(ErrCode::Inconsistent);
        }
        (buf, ptr.offset)
    } else {
        (buf, ptr.offset + d.written as u64)
    };

    let sectors = (buf.len() >> SECTOR_SHIFT) as u32;
    let mut bio = Bio::write(write_at, buf);
    let ret = ca.bdev.submit(&mut bio);

    match ret {
        Ok(()) => {
            d.written = if full_rewrite {
                sectors
            } else {
                d.written + sectors
            };
            d.keys.freeze_written();
            node.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
            Ok(())
        }
        Err(e) => {
            node.set_flag(NodeFlags::WRITE_ERROR | NodeFlags::DIRTY);
            node.clear_flag(NodeFlags::WRITE_IN_FLIGHT);
            ca.count_io_error(cs);
            Err(e)
        }
    }
}

/// Read and validate a node image for `key` at `level`.
pub fn read_node(cs: &CacheSet, key: &Bkey, level: u8) -> Result<NodeData> {
    let Some(ptr) = key.btree_ptr().and_then(|e| e.first_ptr()).copied() else {
        return Err(ErrCode::Inconsistent);
    };
    let Some(ca) = cs.cache(ptr.dev) else {
        error!("btree node read: pointer to missing device {}", ptr.dev);
        cs.set_inconsistent();
        return Err(ErrCode::Inconsistent);
    };

    let mut bio = Bio::read(ptr.offset, ca.bucket_size);
    if let Err(e) = ca.bdev.submit(&mut bio) {
        ca.count_io_error(cs);
        return Err(e);
    }

    let buf = bio.data;
    let first = decode_record(&buf, NODE_MAGIC, None)?.ok_or(ErrCode::IO)?;
    let first_sectors = first.sectors;
    let (hdr_key, hdr_id, hdr_level) = first.header.ok_or(ErrCode::IO)?;
    if hdr_level != level || hdr_key.p != key.p {
        debug!(
            "btree node read: header mismatch (level {hdr_level} vs {level}, pos {:?} vs {:?})",
            hdr_key.p, key.p
        );
        return Err(ErrCode::IO);
    }

    let node_seq = {
        let mut c = Cursor::new(&buf[..]);
        c.set_position(16);
        c.read_u64::<LittleEndian>().map_err(|_| ErrCode::IO)?
    };

    let mut d = NodeData {
        keys: NodeKeys { sets: first.sets, written_sets: 0 },
        written: first_sectors,
        node_seq,
    };

    // Continuation records follow the first image.
    let mut cur = first_sectors as usize;

    while (cur << SECTOR_SHIFT) < buf.len() {
        match decode_record(&buf[cur << SECTOR_SHIFT..], BSET_MAGIC, Some(node_seq))? {
            Some(rec) => {
                d.keys.sets.extend(rec.sets);
                cur += rec.sectors as usize;
            }
            None => break,
        }
    }

    d.written = cur as u32;
    // On-disk runs may overlap each other (in-memory trims never reach
    // already-written sets); resolve them, newest run winning.
    d.keys.sort_fix_overlapping(hdr_id.is_extents());
    d.keys.freeze_written();
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::{pos, POS_MAX};

    fn sample_keys() -> Vec<Bkey> {
        let mut e = ExtentVal::new();
        e.push_ptr(Ptr { dev: 1, gen: 7, offset: 4096 });
        e.dirty = true;
        e.crc = Some(Crc { csum: 0x1234 });
        vec![
            Bkey::new(pos(5, 64), 64, Bval::Extent(e)),
            Bkey::new(pos(6, 0), 0, Bval::Inode(InodeVal::new(1 << 20, "dev"))),
            Bkey::deleted(pos(7, 8), 8),
            Bkey::new(pos(8, 0), 0, Bval::Check),
        ]
    }

    #[test]
    fn bkey_codec_roundtrip() {
        for k in sample_keys() {
            let mut buf = Vec::new();
            encode_bkey(&mut buf, &k);
            let mut cur = Cursor::new(&buf[..]);
            assert_eq!(decode_bkey(&mut cur).unwrap(), k);
        }
    }

    #[test]
    fn record_roundtrip_with_header() {
        let set = Bset { keys: sample_keys() };
        let mut e = ExtentVal::new();
        e.push_ptr(Ptr { dev: 0, gen: 1, offset: 0 });
        let node_key = Bkey::new(POS_MAX, 0, Bval::BtreePtr(e));

        let buf = encode_record(NODE_MAGIC, 42, Some((&node_key, BtreeId::Extents, 1)), &[&set]);
        assert_eq!(buf.len() % SECTOR_SIZE, 0);

        let rec = decode_record(&buf, NODE_MAGIC, None).unwrap().unwrap();
        let (k, id, level) = rec.header.unwrap();
        assert_eq!(k, node_key);
        assert_eq!(id, BtreeId::Extents);
        assert_eq!(level, 1);
        assert_eq!(rec.sets.len(), 1);
        assert_eq!(rec.sets[0].keys, set.keys);
    }

    #[test]
    fn corrupt_record_fails_checksum() {
        let set = Bset { keys: sample_keys() };
        let mut buf = encode_record(BSET_MAGIC, 1, None, &[&set]);
        buf[40] ^= 0xff;
        assert!(matches!(
            decode_record(&buf, BSET_MAGIC, Some(1)),
            Err(ErrCode::IO)
        ));
    }

    #[test]
    fn wrong_seq_is_ignored_not_error() {
        let set = Bset { keys: sample_keys() };
        let buf = encode_record(BSET_MAGIC, 1, None, &[&set]);
        assert!(decode_record(&buf, BSET_MAGIC, Some(2)).unwrap().is_none());
    }
}
