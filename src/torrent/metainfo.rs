//! Torrent metainfo
//!
//! Reads the fields the client needs from a decoded torrent document and
//! computes the info-hash over the raw bytes of the `info` dictionary.

use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::bencode::{self, BencodeNode};
use crate::error::ClientError;

/// A file entry of a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components, e.g. `["folder", "file.txt"]`
    pub path: Vec<String>,
    pub length: u64,
}

/// Fields of a torrent file needed to announce and fetch pieces
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// Flattened `announce-list` tiers, primary first, duplicates removed
    pub announce_list: Vec<String>,
    /// SHA-1 of the raw `info` dictionary bytes
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u64,
    /// One 20-byte SHA-1 per piece
    pub pieces: Vec<[u8; 20]>,
    /// Single-file length (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files of a multi-file torrent (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl Metainfo {
    /// Parse a whole torrent file. Trailing bytes after the root dictionary
    /// are rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ClientError> {
        info!("Parsing torrent metainfo from {} bytes", data.len());
        let root = bencode::decode_exact(data)?;
        Self::from_node(&root, data)
    }

    /// Build from an already decoded root. `source` must be the buffer the
    /// root was decoded from.
    pub fn from_node(root: &BencodeNode, source: &[u8]) -> Result<Self, ClientError> {
        if root.as_dict().is_none() {
            return Err(invalid(format!(
                "root must be a dictionary, found {}",
                root.value.kind()
            )));
        }

        let announce = root
            .lookup(b"announce")
            .and_then(|n| n.as_str())
            .ok_or_else(|| invalid("missing `announce` string"))?
            .to_string();

        let mut announce_list = vec![announce.clone()];
        if let Some(tiers) = root.lookup(b"announce-list").and_then(|n| n.as_list()) {
            for url in tiers.iter().filter_map(|t| t.as_list()).flatten() {
                match url.as_str() {
                    Some(url) if !announce_list.iter().any(|u| u == url) => {
                        announce_list.push(url.to_string())
                    }
                    Some(_) => {}
                    None => warn!("Skipping non-text entry in announce-list"),
                }
            }
        }

        let info_node = root
            .lookup(b"info")
            .ok_or_else(|| invalid("missing `info` dictionary"))?;
        if info_node.as_dict().is_none() {
            return Err(invalid("`info` is not a dictionary"));
        }
        let info_bytes = info_node
            .raw_bytes(source)
            .ok_or_else(|| invalid("`info` span lies outside the source buffer"))?;
        let info_hash = Self::generate_info_hash(info_bytes);
        debug!(
            "Info dictionary spans {}..{}, info hash {}",
            info_node.start,
            info_node.end,
            hex::encode(info_hash)
        );

        let name = info_node
            .lookup(b"name")
            .and_then(|n| n.as_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| invalid("missing `name`"))?;

        let piece_length = info_node
            .lookup(b"piece length")
            .and_then(|n| n.as_int())
            .filter(|len| *len > 0)
            .ok_or_else(|| invalid("missing or non-positive `piece length`"))?
            as u64;

        let pieces_bytes = info_node
            .lookup(b"pieces")
            .and_then(|n| n.as_bytes())
            .ok_or_else(|| invalid("missing `pieces`"))?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let (length, files) = if let Some(len) = info_node.lookup(b"length") {
            let len = len
                .as_int()
                .filter(|l| *l >= 0)
                .ok_or_else(|| invalid("invalid `length`"))?;
            (Some(len as u64), None)
        } else if let Some(list) = info_node.lookup(b"files").and_then(|n| n.as_list()) {
            let files = list
                .iter()
                .map(Self::parse_file_entry)
                .collect::<Result<Vec<TorrentFile>, _>>()?;
            files
                .iter()
                .try_fold(0u64, |total, f| total.checked_add(f.length))
                .ok_or_else(|| invalid("file lengths overflow a 64-bit total"))?;
            (None, Some(files))
        } else {
            return Err(invalid("neither `length` nor `files` present in info"));
        };

        let metainfo = Self {
            announce,
            announce_list,
            info_hash,
            name,
            piece_length,
            pieces,
            length,
            files,
        };
        info!(
            "Loaded torrent '{}': {} bytes in {} pieces",
            metainfo.name,
            metainfo.total_size(),
            metainfo.piece_count()
        );
        Ok(metainfo)
    }

    fn parse_file_entry(entry: &BencodeNode) -> Result<TorrentFile, ClientError> {
        let length = entry
            .lookup(b"length")
            .and_then(|n| n.as_int())
            .filter(|l| *l >= 0)
            .ok_or_else(|| invalid("file entry without a valid `length`"))? as u64;
        let path = entry
            .lookup(b"path")
            .and_then(|n| n.as_list())
            .ok_or_else(|| invalid("file entry without `path`"))?
            .iter()
            .filter_map(|c| c.as_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        Ok(TorrentFile { path, length })
    }

    /// SHA-1 of the raw info dictionary bytes
    pub fn generate_info_hash(info_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` string into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>, ClientError> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(invalid(format!(
                "`pieces` length must be a multiple of 20, got {}",
                pieces_bytes.len()
            )));
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    pub fn total_size(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(length), _) => *length,
            (None, Some(files)) => files
                .iter()
                .fold(0u64, |total, f| total.saturating_add(f.length)),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Actual size of a piece; the last one is usually shorter
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = (index as u64).saturating_mul(self.piece_length);
        let end = start
            .saturating_add(self.piece_length)
            .min(self.total_size());
        Some(end.saturating_sub(start))
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::Metainfo(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let mut doc = Vec::new();
        doc.extend_from_slice(b"d8:announce31:http://tracker.example/announce");
        doc.extend_from_slice(b"13:announce-listll31:http://tracker.example/announceel18:udp://other:80/annee");
        doc.extend_from_slice(b"4:infod6:lengthi5e4:name5:hello12:piece lengthi4e6:pieces40:");
        doc.extend_from_slice(&[0xAA; 20]);
        doc.extend_from_slice(&[0xBB; 20]);
        doc.extend_from_slice(b"ee");
        doc
    }

    #[test]
    fn test_parse_single_file() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();

        assert_eq!(meta.announce, "http://tracker.example/announce");
        assert_eq!(
            meta.announce_list,
            vec!["http://tracker.example/announce", "udp://other:80/ann"]
        );
        assert_eq!(meta.name, "hello");
        assert_eq!(meta.piece_length, 4);
        assert_eq!(meta.total_size(), 5);
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.piece_hash(1), Some([0xBB; 20]));
        assert_eq!(meta.piece_size(0), Some(4));
        assert_eq!(meta.piece_size(1), Some(1));
        assert_eq!(meta.piece_size(2), None);
    }

    #[test]
    fn test_info_hash_uses_raw_bytes() {
        let data = single_file_torrent();
        let meta = Metainfo::from_bytes(&data).unwrap();

        let start = data.windows(5).position(|w| w == b"infod").unwrap() + 4;
        let end = data.len() - 1;
        let expected = Metainfo::generate_info_hash(&data[start..end]);
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_multi_file() {
        let data = b"d8:announce9:udp://x:14:infod5:filesld6:lengthi3e4:pathl1:aeed6:lengthi4e4:pathl1:b1:ceee4:name3:dir12:piece lengthi8e6:pieces0:ee";
        let meta = Metainfo::from_bytes(data).unwrap();
        let files = meta.files.as_ref().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].path, vec!["b", "c"]);
        assert_eq!(meta.total_size(), 7);
        assert!(meta.length.is_none());
    }

    #[test]
    fn test_total_size_overflow_rejected() {
        let mut data = b"d8:announce9:udp://x:14:infod5:filesl".to_vec();
        for _ in 0..19 {
            data.extend_from_slice(b"d6:lengthi999999999999999999e4:pathl1:aee");
        }
        data.extend_from_slice(b"e4:name3:dir12:piece lengthi8e6:pieces0:ee");
        assert!(matches!(
            Metainfo::from_bytes(&data),
            Err(ClientError::Metainfo(m)) if m.contains("overflow")
        ));
    }

    #[test]
    fn test_piece_size_near_u64_max() {
        let mut data = b"d8:announce9:udp://x:14:infod6:lengthi999999999999999999e4:name1:x12:piece lengthi999999999999999999e6:pieces400:".to_vec();
        data.extend_from_slice(&[0xCC; 400]);
        data.extend_from_slice(b"ee");
        let meta = Metainfo::from_bytes(&data).unwrap();
        assert_eq!(meta.piece_count(), 20);
        assert_eq!(meta.piece_size(0), Some(999_999_999_999_999_999));
        assert_eq!(meta.piece_size(1), Some(0));
        assert_eq!(meta.piece_size(19), Some(0));
    }

    #[test]
    fn test_missing_fields() {
        assert!(matches!(
            Metainfo::from_bytes(b"d4:infodee"),
            Err(ClientError::Metainfo(_))
        ));
        assert!(Metainfo::from_bytes(b"d8:announce1:x4:infoi1ee").is_err());
        assert!(Metainfo::from_bytes(b"le").is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut data = single_file_torrent();
        data.extend_from_slice(b"junk");
        assert!(matches!(
            Metainfo::from_bytes(&data),
            Err(ClientError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_piece_hashes() {
        assert_eq!(Metainfo::parse_piece_hashes(&[1u8; 40]).unwrap().len(), 2);
        assert!(Metainfo::parse_piece_hashes(&[1u8; 21]).is_err());
    }
}
