//! Indexed JSON documents that can be read lazily.
//!
//! A document is written as a small header giving the location of an offset index, the index
//! itself, and then the data. The index mirrors the shape of the data: every scalar has an
//! `(offset, size)` pair pointing into the data section, and every container additionally
//! records its own span (`__total__` for maps, a trailing entry for sequences). Reading one
//! element of a large sequence then only requires decoding the header, the index, and the few
//! bytes of that element.
//!
//! The header has a fixed layout so that a reader can always find the index:
//!
//! ```text
//! {"locs": [      iloc,       ilen,       dloc,       dlen],
//!  "index": <index>,
//!  "data": <data>
//! }
//! ```
//!
//! Each of the four locations is right-aligned in a ten character field. The index starts at
//! byte 69 and the `locs` array occupies the 48 bytes starting at byte 9.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use json::JsonValue;

use crate::error::{HistoryError, Result};

/// Byte offset of the index document.
pub const INDEX_LOCATION: u64 = 69;

/// Byte offset and length of the `locs` array in the header.
const LOCS_OFFSET: u64 = 9;
const LOCS_LEN: usize = 48;

/// Length of `,\n "data": ` which separates the index from the data.
const DATA_SEPARATOR_LEN: u64 = 11;

/// Key under which a map's own span is recorded in the index.
pub const TOTAL_KEY: &str = "__total__";

/// The location of one serialized value within the data section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: u64,
    pub size: u64,
}

impl Span {
    fn new(offset: usize, size: usize) -> Self {
        Self {
            offset: offset as u64,
            size: size as u64,
        }
    }
}

/// An offset index, isomorphic to the data it describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexTree {
    Leaf(Span),
    Map {
        entries: Vec<(String, Arc<IndexTree>)>,
        total: Span,
    },
    Seq {
        items: Vec<Arc<IndexTree>>,
        total: Span,
    },
}

impl IndexTree {
    /// The span covering this whole value.
    pub fn span(&self) -> Span {
        match self {
            IndexTree::Leaf(span) => *span,
            IndexTree::Map { total, .. } | IndexTree::Seq { total, .. } => *total,
        }
    }

    /// Number of keys or elements. Scalars have length 0.
    pub fn len(&self) -> usize {
        match self {
            IndexTree::Leaf(_) => 0,
            IndexTree::Map { entries, .. } => entries.len(),
            IndexTree::Seq { items, .. } => items.len(),
        }
    }

    fn lookup(&self, key: &str) -> Option<&Arc<IndexTree>> {
        match self {
            IndexTree::Map { entries, .. } => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Render as the on-disk `{"offsets": ..., "sizes": ...}` document.
    pub fn to_json(&self) -> JsonValue {
        let mut doc = JsonValue::new_object();
        doc["offsets"] = self.project(|span| span.offset);
        doc["sizes"] = self.project(|span| span.size);
        doc
    }

    fn project(&self, field: fn(&Span) -> u64) -> JsonValue {
        match self {
            IndexTree::Leaf(span) => field(span).into(),
            IndexTree::Map { entries, total } => {
                let mut obj = JsonValue::new_object();
                for (key, child) in entries {
                    obj[key.as_str()] = child.project(field);
                }
                obj[TOTAL_KEY] = field(total).into();
                obj
            }
            IndexTree::Seq { items, total } => {
                let mut arr: Vec<JsonValue> = items.iter().map(|c| c.project(field)).collect();
                arr.push(field(total).into());
                JsonValue::Array(arr)
            }
        }
    }

    /// Rebuild an index from its on-disk `offsets` and `sizes` trees.
    pub fn from_json(offsets: &JsonValue, sizes: &JsonValue) -> Result<Self> {
        let mismatch = || HistoryError::InvalidFormat("offsets and sizes differ in shape".into());
        match (offsets, sizes) {
            (JsonValue::Object(offs), JsonValue::Object(szs)) => {
                let total = leaf_span(&offs[TOTAL_KEY], &szs[TOTAL_KEY])?;
                let mut entries = Vec::with_capacity(offs.len().saturating_sub(1));
                for (key, off) in offs.iter() {
                    if key == TOTAL_KEY {
                        continue;
                    }
                    let size = szs.get(key).ok_or_else(mismatch)?;
                    entries.push((key.to_owned(), Arc::new(IndexTree::from_json(off, size)?)));
                }
                Ok(IndexTree::Map { entries, total })
            }
            (JsonValue::Array(offs), JsonValue::Array(szs)) => {
                if offs.len() != szs.len() || offs.is_empty() {
                    return Err(mismatch());
                }
                let n = offs.len() - 1;
                let total = leaf_span(&offs[n], &szs[n])?;
                let items = offs[..n]
                    .iter()
                    .zip(&szs[..n])
                    .map(|(o, s)| IndexTree::from_json(o, s).map(Arc::new))
                    .collect::<Result<Vec<_>>>()?;
                Ok(IndexTree::Seq { items, total })
            }
            (o, s) => Ok(IndexTree::Leaf(leaf_span(o, s)?)),
        }
    }
}

fn leaf_span(offset: &JsonValue, size: &JsonValue) -> Result<Span> {
    match (offset.as_u64(), size.as_u64()) {
        (Some(offset), Some(size)) => Ok(Span { offset, size }),
        _ => Err(HistoryError::InvalidFormat(format!(
            "bad index entry: {} / {}",
            offset.dump(),
            size.dump()
        ))),
    }
}

/// Serialize `value` and compute its index. Offsets are relative to the start of the returned
/// text. Map keys are emitted in sorted order if `sort_keys` is set, else in insertion order.
pub fn serialize_with_index(value: &JsonValue, sort_keys: bool) -> (String, IndexTree) {
    let mut out = String::new();
    let index = write_indexed(value, &mut out, sort_keys);
    (out, index)
}

fn write_indexed(value: &JsonValue, out: &mut String, sort_keys: bool) -> IndexTree {
    let start = out.len();
    match value {
        JsonValue::Object(obj) => {
            let mut fields: Vec<(&str, &JsonValue)> = obj.iter().collect();
            if sort_keys {
                fields.sort_by(|a, b| a.0.cmp(b.0));
            }
            out.push('{');
            let mut entries = Vec::with_capacity(fields.len());
            for (i, (key, val)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&json::stringify(key));
                out.push_str(": ");
                let child = write_indexed(val, out, sort_keys);
                entries.push((key.to_owned(), Arc::new(child)));
            }
            out.push_str("}\n");
            IndexTree::Map {
                entries,
                total: Span::new(start, out.len() - start),
            }
        }
        JsonValue::Array(arr) => {
            out.push('[');
            let mut items = Vec::with_capacity(arr.len());
            for (i, val) in arr.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                items.push(Arc::new(write_indexed(val, out, sort_keys)));
            }
            out.push_str("]\n");
            IndexTree::Seq {
                items,
                total: Span::new(start, out.len() - start),
            }
        }
        scalar => {
            out.push_str(&scalar.dump());
            IndexTree::Leaf(Span::new(start, out.len() - start))
        }
    }
}

/// Render `value` as a complete indexed document.
pub fn dumps(value: &JsonValue, sort_keys: bool) -> String {
    let (data, index) = serialize_with_index(value, sort_keys);
    let index = index.to_json().dump();
    let ilen = index.len() as u64;
    let dloc = INDEX_LOCATION + ilen + DATA_SEPARATOR_LEN;
    let dlen = data.len();
    format!(
        "{{\"locs\": [{INDEX_LOCATION:>10}, {ilen:>10}, {dloc:>10}, {dlen:>10}],\n \"index\": {index},\n \"data\": {data}\n}}\n"
    )
}

/// Write `value` as a complete indexed document.
pub fn dump(value: &JsonValue, out: &mut impl Write, sort_keys: bool) -> io::Result<()> {
    out.write_all(dumps(value, sort_keys).as_bytes())
}

trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

enum Backing {
    /// Open the file again for every read, so concurrent readers never share a cursor.
    Reopen(PathBuf),
    /// A single reader, kept open between reads.
    Held(Mutex<Box<dyn ReadSeek>>),
}

/// The shared owner of an open document: where its bytes come from and where its data starts.
struct LazySource {
    backing: Backing,
    dloc: u64,
    dlen: u64,
}

impl LazySource {
    fn read_data(&self, span: Span) -> Result<String> {
        let start = self.dloc.checked_add(span.offset);
        let end = span.offset.checked_add(span.size);
        match (start, end) {
            (Some(start), Some(end)) if end <= self.dlen => read_at(&self.backing, start, span.size),
            _ => Err(truncated(self.dloc.saturating_add(span.offset), span.size)),
        }
    }
}

fn truncated(offset: u64, wanted: u64) -> HistoryError {
    HistoryError::TruncatedData {
        offset,
        wanted: wanted as usize,
    }
}

/// Read exactly `size` bytes at `offset`. Spans reaching past the end of the stream fail
/// before anything is allocated for them.
fn read_span<R: Read + Seek + ?Sized>(reader: &mut R, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    let len = reader.seek(SeekFrom::End(0))?;
    if offset.checked_add(size).is_none_or(|end| end > len) {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let mut buf = vec![0; size as usize];
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_at(backing: &Backing, offset: u64, size: u64) -> Result<String> {
    let res = match backing {
        Backing::Reopen(path) => {
            let mut file = File::open(path)?;
            read_span(&mut file, offset, size)
        }
        Backing::Held(reader) => {
            let mut reader = reader.lock().unwrap_or_else(|e| e.into_inner());
            read_span(&mut **reader, offset, size)
        }
    };
    let buf = match res {
        Ok(buf) => buf,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(truncated(offset, size));
        }
        Err(err) => return Err(err.into()),
    };
    String::from_utf8(buf).map_err(|_| HistoryError::InvalidFormat("data is not UTF-8".into()))
}

/// What a lazy lookup produced.
#[derive(Debug)]
pub enum LazyValue {
    /// A decoded scalar.
    Value(JsonValue),
    /// A container, not yet read.
    Node(LazyNode),
}

impl LazyValue {
    /// Materialize the value, reading a container's whole span if needed.
    pub fn load(self) -> Result<JsonValue> {
        match self {
            LazyValue::Value(v) => Ok(v),
            LazyValue::Node(node) => node.load(),
        }
    }
}

/// A map or sequence within an open document. Cloning is cheap; all nodes of a document share
/// its source.
#[derive(Clone)]
pub struct LazyNode {
    source: Arc<LazySource>,
    index: Arc<IndexTree>,
}

impl std::fmt::Debug for LazyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyNode")
            .field("span", &self.index.span())
            .field("len", &self.index.len())
            .finish()
    }
}

impl LazyNode {
    /// Open the document at `path`. Each later read reopens the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_header(Backing::Reopen(path.as_ref().to_owned()))
    }

    /// Read the document from `reader`, which is kept for subsequent reads.
    pub fn from_reader<R: Read + Seek + Send + 'static>(reader: R) -> Result<Self> {
        Self::load_header(Backing::Held(Mutex::new(Box::new(reader))))
    }

    fn load_header(backing: Backing) -> Result<Self> {
        let header_err = |e: HistoryError| match e {
            HistoryError::TruncatedData { .. } => {
                HistoryError::InvalidFormat("truncated history header".into())
            }
            e => e,
        };
        let locs = read_at(&backing, LOCS_OFFSET, LOCS_LEN as u64).map_err(header_err)?;
        let locs = json::parse(&locs)?;
        let loc = |i: usize| {
            locs[i]
                .as_u64()
                .ok_or_else(|| HistoryError::InvalidFormat(format!("bad locs entry {i}")))
        };
        let (iloc, ilen, dloc, dlen) = (loc(0)?, loc(1)?, loc(2)?, loc(3)?);

        let index = read_at(&backing, iloc, ilen).map_err(header_err)?;
        let index = json::parse(&index)?;
        let tree = IndexTree::from_json(&index["offsets"], &index["sizes"])?;
        if matches!(tree, IndexTree::Leaf(_)) {
            return Err(HistoryError::InvalidFormat(
                "top-level value is not a container".into(),
            ));
        }
        Ok(LazyNode {
            source: Arc::new(LazySource {
                backing,
                dloc,
                dlen,
            }),
            index: Arc::new(tree),
        })
    }

    fn wrap(&self, index: &Arc<IndexTree>) -> Result<LazyValue> {
        match index.as_ref() {
            IndexTree::Leaf(span) => {
                let text = self.source.read_data(*span)?;
                Ok(LazyValue::Value(json::parse(&text)?))
            }
            _ => Ok(LazyValue::Node(LazyNode {
                source: Arc::clone(&self.source),
                index: Arc::clone(index),
            })),
        }
    }

    /// Look up a key in a map node.
    pub fn get(&self, key: &str) -> Result<LazyValue> {
        let child = self
            .index
            .lookup(key)
            .ok_or_else(|| HistoryError::KeyNotFound(key.to_owned()))?;
        self.wrap(child)
    }

    /// Look up an element of a sequence node.
    pub fn index(&self, i: usize) -> Result<LazyValue> {
        match self.index.as_ref() {
            IndexTree::Seq { items, .. } => match items.get(i) {
                Some(child) => self.wrap(child),
                None => Err(HistoryError::IndexOutOfRange {
                    index: i as isize,
                    len: items.len(),
                }),
            },
            _ => Err(HistoryError::KeyNotFound(i.to_string())),
        }
    }

    /// Look up a key and materialize whatever is there.
    pub fn load_key(&self, key: &str) -> Result<JsonValue> {
        self.get(key)?.load()
    }

    /// Read and decode this node's whole span.
    pub fn load(&self) -> Result<JsonValue> {
        let text = self.source.read_data(self.index.span())?;
        Ok(json::parse(&text)?)
    }

    /// Keys of a map node, in file order. Sequences have no keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        let entries: &[(String, Arc<IndexTree>)] = match self.index.as_ref() {
            IndexTree::Map { entries, .. } => entries,
            _ => &[],
        };
        entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_map(&self) -> bool {
        matches!(self.index.as_ref(), IndexTree::Map { .. })
    }

    /// The index of this node.
    pub fn index_tree(&self) -> &IndexTree {
        &self.index
    }
}
