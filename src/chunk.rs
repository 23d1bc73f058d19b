//! Decoding and encoding of compiled resource chunks.
//!
//! A compiled XML document is a `RES_XML_TYPE` chunk containing a string
//! pool, an optional attribute resource map and a flat stream of node
//! chunks. [`XmlTree::decode`] turns that stream into a token list that
//! [`crate::xml_cursor::BinaryXmlCursor`] walks; [`ChunkPool`] decodes the
//! pooled strings together with their inline style runs. The inverse writer
//! ([`Element::encode_document`]) exists so tools and tests can fabricate
//! compiled documents without binary fixtures.

use crate::string_pool::{PoolSource, StyleRun};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

const STRING_FLAG_UTF8: u32 = 0x0000_0100;

/// Style-run terminator inside the pool's style section.
const SPAN_END: u32 = 0xFFFF_FFFF;

/// Index value meaning "no pool entry".
pub const NO_ENTRY: u32 = 0xFFFF_FFFF;

/// Typed-value data type tags, as recorded per attribute in the chunk.
pub mod data_type {
    pub const NULL: u8 = 0x00;
    pub const REFERENCE: u8 = 0x01;
    pub const ATTRIBUTE: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const INT_DEC: u8 = 0x10;
    pub const INT_HEX: u8 = 0x11;
    pub const INT_BOOLEAN: u8 = 0x12;
    pub const FIRST_INT: u8 = 0x10;
    pub const LAST_INT: u8 = 0x1f;
    pub const FIRST_COLOR_INT: u8 = 0x1c;
    pub const LAST_COLOR_INT: u8 = 0x1f;
}

/// Result alias for chunk decode/encode operations.
pub type ChunkResult<T> = Result<T, ChunkError>;

/// Errors surfaced while decoding or encoding compiled chunks.
#[derive(Debug)]
pub enum ChunkError {
    /// The chunk bytes do not have the expected structure.
    Malformed(String),
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::Malformed(msg) => write!(f, "Malformed resource chunk: {msg}"),
        }
    }
}

impl std::error::Error for ChunkError {}

fn malformed(msg: impl Into<String>) -> ChunkError {
    ChunkError::Malformed(msg.into())
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    chunk_size: u32,
    start: usize,
}

impl ChunkHeader {
    fn end(&self) -> usize {
        self.start + self.chunk_size as usize
    }
}

struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        ChunkReader { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> ChunkResult<u8> {
        if self.pos + 1 > self.data.len() {
            return Err(malformed("unexpected end of chunk data"));
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> ChunkResult<u16> {
        if self.pos + 2 > self.data.len() {
            return Err(malformed("unexpected end of chunk data"));
        }
        let value = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> ChunkResult<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(malformed("unexpected end of chunk data"));
        }
        let value = u32::from_le_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    fn seek(&mut self, offset: usize) -> ChunkResult<()> {
        if offset > self.data.len() {
            return Err(malformed("attempted to seek past end of chunk"));
        }
        self.pos = offset;
        Ok(())
    }
}

fn read_chunk_header(reader: &mut ChunkReader<'_>) -> ChunkResult<ChunkHeader> {
    let start = reader.position();
    if reader.remaining() < 8 {
        return Err(malformed("truncated chunk header"));
    }
    let chunk_type = reader.read_u16()?;
    let header_size = reader.read_u16()?;
    let chunk_size = reader.read_u32()?;
    if chunk_size < header_size as u32 {
        return Err(malformed("chunk smaller than its own header"));
    }
    let end = start
        .checked_add(chunk_size as usize)
        .ok_or_else(|| malformed("chunk size overflow"))?;
    if end > reader.data.len() {
        return Err(malformed("chunk extends past end of data"));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        chunk_size,
        start,
    })
}

/// A decoded `RES_STRING_POOL_TYPE` chunk: the strings plus any inline
/// style runs attached to them. This is the concrete [`PoolSource`] used
/// for real compiled documents.
pub struct ChunkPool {
    strings: Vec<String>,
    styles: Vec<Vec<StyleRun>>,
}

impl ChunkPool {
    /// Decodes a standalone string-pool chunk.
    pub fn from_chunk(bytes: &[u8]) -> ChunkResult<Self> {
        let mut reader = ChunkReader::new(bytes);
        let header = read_chunk_header(&mut reader)?;
        if header.chunk_type != RES_STRING_POOL_TYPE {
            return Err(malformed("expected a string pool chunk"));
        }
        Self::parse(&mut reader, &header)
    }

    fn parse(reader: &mut ChunkReader<'_>, header: &ChunkHeader) -> ChunkResult<Self> {
        let string_count = reader.read_u32()? as usize;
        let style_count = reader.read_u32()? as usize;
        let flags = reader.read_u32()?;
        let strings_start = reader.read_u32()? as usize;
        let styles_start = reader.read_u32()? as usize;

        let is_utf8 = (flags & STRING_FLAG_UTF8) != 0;
        let chunk_end = header.end();

        let mut string_offsets = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            string_offsets.push(reader.read_u32()? as usize);
        }
        let mut style_offsets = Vec::with_capacity(style_count);
        for _ in 0..style_count {
            style_offsets.push(reader.read_u32()? as usize);
        }

        let strings_base = header.start + strings_start;
        let mut strings = Vec::with_capacity(string_count);
        for offset in string_offsets {
            let absolute = strings_base + offset;
            let text = if is_utf8 {
                read_utf8_string(reader.data, absolute, chunk_end)?
            } else {
                read_utf16_string(reader.data, absolute, chunk_end)?
            };
            strings.push(text);
        }

        let mut styles = Vec::with_capacity(style_count);
        if styles_start != 0 {
            let styles_base = header.start + styles_start;
            for offset in style_offsets {
                styles.push(read_style_entry(reader.data, styles_base + offset, chunk_end)?);
            }
        }

        // Compiled pools index style runs in UTF-16 code units; everything
        // downstream addresses bytes, so remap here.
        for (index, runs) in styles.iter_mut().enumerate() {
            if runs.is_empty() {
                continue;
            }
            if let Some(text) = strings.get(index) {
                if !text.is_ascii() {
                    for run in runs.iter_mut() {
                        let start = utf16_unit_to_byte(text, run.first as usize);
                        let end = utf16_unit_to_byte(text, run.last as usize + 1);
                        run.first = start as u32;
                        run.last = end.saturating_sub(1) as u32;
                    }
                }
            }
        }

        reader.seek(chunk_end)?;
        Ok(ChunkPool { strings, styles })
    }
}

impl PoolSource for ChunkPool {
    fn len(&self) -> usize {
        self.strings.len()
    }

    fn string_at(&self, index: usize) -> ChunkResult<String> {
        self.strings
            .get(index)
            .cloned()
            .ok_or_else(|| malformed(format!("string index {index} out of range")))
    }

    fn style_runs_at(&self, index: usize) -> ChunkResult<Vec<StyleRun>> {
        if index >= self.strings.len() {
            return Err(malformed(format!("string index {index} out of range")));
        }
        Ok(self.styles.get(index).cloned().unwrap_or_default())
    }
}

fn read_style_entry(data: &[u8], offset: usize, limit: usize) -> ChunkResult<Vec<StyleRun>> {
    let mut cursor = offset;
    let mut runs = Vec::new();
    loop {
        if cursor + 4 > limit {
            return Err(malformed("style entry exceeds chunk bounds"));
        }
        let tag = read_u32_at(data, cursor);
        if tag == SPAN_END {
            break;
        }
        if cursor + 12 > limit {
            return Err(malformed("truncated style run"));
        }
        let first = read_u32_at(data, cursor + 4);
        let last = read_u32_at(data, cursor + 8);
        runs.push(StyleRun { tag, first, last });
        cursor += 12;
    }
    Ok(runs)
}

fn utf16_unit_to_byte(text: &str, unit: usize) -> usize {
    let mut units = 0;
    for (byte, ch) in text.char_indices() {
        if units >= unit {
            return byte;
        }
        units += ch.len_utf16();
    }
    text.len()
}

fn byte_to_utf16_unit(text: &str, byte: usize) -> usize {
    let mut units = 0;
    for (offset, ch) in text.char_indices() {
        if offset >= byte {
            return units;
        }
        units += ch.len_utf16();
    }
    units
}

fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_utf8_string(data: &[u8], offset: usize, limit: usize) -> ChunkResult<String> {
    let mut cursor = offset;
    if cursor >= limit {
        return Err(malformed("string offset exceeds chunk bounds"));
    }
    let (_char_len, len_bytes) = read_utf8_length(data, cursor, limit)?;
    cursor += len_bytes;
    let (byte_len, byte_len_size) = read_utf8_length(data, cursor, limit)?;
    cursor += byte_len_size;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-8 string exceeds chunk bounds"));
    }
    let slice = &data[cursor..cursor + byte_len];
    cursor += byte_len;
    if cursor >= limit {
        return Err(malformed("missing UTF-8 terminator"));
    }
    // aapt occasionally emits CESU-8 sequences (surrogate pairs encoded
    // separately) in pools marked UTF-8, so fall back to a lenient decode.
    match std::str::from_utf8(slice) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => cesu8::from_java_cesu8(slice)
            .map(Cow::into_owned)
            .map_err(|err| malformed(err.to_string())),
    }
}

fn read_utf16_string(data: &[u8], offset: usize, limit: usize) -> ChunkResult<String> {
    let mut cursor = offset;
    let (char_count, header_bytes) = read_utf16_length(data, cursor, limit)?;
    cursor += header_bytes;
    let byte_len = char_count * 2;
    if cursor + byte_len > limit {
        return Err(malformed("UTF-16 string exceeds chunk bounds"));
    }
    let mut units = Vec::with_capacity(char_count);
    for pair in data[cursor..cursor + byte_len].chunks_exact(2) {
        units.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    cursor += byte_len;
    if cursor + 2 > limit {
        return Err(malformed("missing UTF-16 terminator"));
    }
    let terminator = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
    if terminator != 0 {
        return Err(malformed("UTF-16 string missing terminator"));
    }
    String::from_utf16(&units).map_err(|err| malformed(err.to_string()))
}

fn read_utf8_length(data: &[u8], offset: usize, limit: usize) -> ChunkResult<(usize, usize)> {
    if offset >= limit {
        return Err(malformed("invalid UTF-8 length offset"));
    }
    let first = data[offset];
    if (first & 0x80) == 0 {
        Ok((first as usize, 1))
    } else {
        if offset + 1 >= limit {
            return Err(malformed("truncated UTF-8 length"));
        }
        let second = data[offset + 1];
        Ok(((((first & 0x7F) as usize) << 8) | second as usize, 2))
    }
}

fn read_utf16_length(data: &[u8], offset: usize, limit: usize) -> ChunkResult<(usize, usize)> {
    if offset + 2 > limit {
        return Err(malformed("invalid UTF-16 length offset"));
    }
    let first = u16::from_le_bytes([data[offset], data[offset + 1]]);
    if (first & 0x8000) == 0 {
        Ok((first as usize, 2))
    } else {
        if offset + 4 > limit {
            return Err(malformed("truncated UTF-16 length"));
        }
        let second = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        Ok(((((first & 0x7FFF) as usize) << 16) | second as usize, 4))
    }
}

/// One attribute record inside a start-element token, exactly as encoded.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AttributeEntry {
    pub ns: u32,
    pub name: u32,
    pub raw: u32,
    pub data_type: u8,
    pub data: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct StartElement {
    pub line: u32,
    pub ns: u32,
    pub name: u32,
    pub id_index: u16,
    pub class_index: u16,
    pub style_index: u16,
    pub attributes: Vec<AttributeEntry>,
}

#[derive(Clone, Debug)]
pub(crate) enum Token {
    StartNamespace { prefix: u32, uri: u32 },
    EndNamespace,
    StartElement(Box<StartElement>),
    EndElement { line: u32, ns: u32, name: u32 },
    Text { line: u32, data_index: u32, data_type: u8, data: u32 },
}

/// A fully decoded binary XML document body: the node tokens in document
/// order plus the attribute resource map. The associated string pool is
/// returned alongside by [`XmlTree::decode`].
pub struct XmlTree {
    pub(crate) tokens: Vec<Token>,
    pub(crate) resource_map: Vec<u32>,
}

impl XmlTree {
    /// Decodes a whole `RES_XML_TYPE` document into its token stream and
    /// string pool.
    pub fn decode(bytes: &[u8]) -> ChunkResult<(XmlTree, ChunkPool)> {
        let mut reader = ChunkReader::new(bytes);
        let document = read_chunk_header(&mut reader)?;
        if document.chunk_type != RES_XML_TYPE {
            return Err(malformed("document does not start with RES_XML_TYPE"));
        }
        let document_end = document.end();
        reader.seek(document.start + document.header_size as usize)?;

        let mut pool: Option<ChunkPool> = None;
        let mut resource_map = Vec::new();
        let mut tokens = Vec::new();
        let mut open_elements = 0usize;

        while reader.position() < document_end {
            let header = read_chunk_header(&mut reader)?;
            let chunk_end = header.end();
            match header.chunk_type {
                RES_STRING_POOL_TYPE => {
                    pool = Some(ChunkPool::parse(&mut reader, &header)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    let mut ids = Vec::new();
                    while reader.position() < chunk_end {
                        ids.push(reader.read_u32()?);
                    }
                    resource_map = ids;
                }
                RES_XML_START_NAMESPACE_TYPE => {
                    reader.read_u32()?; // line number
                    reader.read_u32()?; // comment
                    let prefix = reader.read_u32()?;
                    let uri = reader.read_u32()?;
                    tokens.push(Token::StartNamespace { prefix, uri });
                }
                RES_XML_END_NAMESPACE_TYPE => {
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    reader.read_u32()?;
                    tokens.push(Token::EndNamespace);
                }
                RES_XML_START_ELEMENT_TYPE => {
                    if pool.is_none() {
                        return Err(malformed("start element before string pool"));
                    }
                    let line = reader.read_u32()?;
                    reader.read_u32()?; // comment
                    let ns = reader.read_u32()?;
                    let name = reader.read_u32()?;
                    let attribute_start = reader.read_u16()? as usize;
                    let attribute_size = reader.read_u16()? as usize;
                    let attr_count = reader.read_u16()? as usize;
                    let id_index = reader.read_u16()?;
                    let class_index = reader.read_u16()?;
                    let style_index = reader.read_u16()?;
                    // attributeStart is relative to the extended header, and
                    // compilers may emit wider records (extra trailing bytes
                    // such as comments); honor both rather than assume the
                    // packed 20-byte layout.
                    if attribute_size < 20 {
                        return Err(malformed("attribute record smaller than its fixed fields"));
                    }
                    let attrs_base = header.start + header.header_size as usize + attribute_start;
                    if attr_count != 0 && attrs_base + attr_count * attribute_size > chunk_end {
                        return Err(malformed("attribute array exceeds chunk bounds"));
                    }
                    let mut attributes = Vec::with_capacity(attr_count);
                    for i in 0..attr_count {
                        reader.seek(attrs_base + i * attribute_size)?;
                        let attr_ns = reader.read_u32()?;
                        let attr_name = reader.read_u32()?;
                        let raw = reader.read_u32()?;
                        let value_size = reader.read_u16()?;
                        reader.read_u8()?; // res0
                        let data_type = reader.read_u8()?;
                        let data = reader.read_u32()?;
                        if value_size != 8 {
                            return Err(malformed("attribute value size must be 8"));
                        }
                        attributes.push(AttributeEntry {
                            ns: attr_ns,
                            name: attr_name,
                            raw,
                            data_type,
                            data,
                        });
                    }
                    open_elements += 1;
                    tokens.push(Token::StartElement(Box::new(StartElement {
                        line,
                        ns,
                        name,
                        id_index,
                        class_index,
                        style_index,
                        attributes,
                    })));
                }
                RES_XML_END_ELEMENT_TYPE => {
                    let line = reader.read_u32()?;
                    reader.read_u32()?;
                    let ns = reader.read_u32()?;
                    let name = reader.read_u32()?;
                    if open_elements == 0 {
                        return Err(malformed("end element without matching start"));
                    }
                    open_elements -= 1;
                    tokens.push(Token::EndElement { line, ns, name });
                }
                RES_XML_CDATA_TYPE => {
                    let line = reader.read_u32()?;
                    reader.read_u32()?;
                    let data_index = reader.read_u32()?;
                    let value_size = reader.read_u16()?;
                    reader.read_u8()?;
                    let data_type = reader.read_u8()?;
                    let data = reader.read_u32()?;
                    if value_size != 8 {
                        return Err(malformed("CDATA value size must be 8"));
                    }
                    tokens.push(Token::Text {
                        line,
                        data_index,
                        data_type,
                        data,
                    });
                }
                _ => {
                    // Unknown chunk type; skip over it for forward compatibility.
                }
            }
            reader.seek(chunk_end)?;
        }

        if open_elements != 0 {
            return Err(malformed("unclosed elements at end of document"));
        }
        let pool = pool.ok_or_else(|| malformed("document has no string pool"))?;
        Ok((
            XmlTree {
                tokens,
                resource_map,
            },
            pool,
        ))
    }
}

// ---------------------------------------------------------------------------
// Writer side: fabricate compiled documents for tools and tests.
// ---------------------------------------------------------------------------

/// A typed attribute value for the writer.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    Null,
    Str(String),
    Boolean(bool),
    Int(i32),
    Hex(u32),
    Float(f32),
    Reference(u32),
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        TypedValue::Str(value.to_owned())
    }
}

impl From<bool> for TypedValue {
    fn from(value: bool) -> Self {
        TypedValue::Boolean(value)
    }
}

impl From<i32> for TypedValue {
    fn from(value: i32) -> Self {
        TypedValue::Int(value)
    }
}

impl From<f32> for TypedValue {
    fn from(value: f32) -> Self {
        TypedValue::Float(value)
    }
}

/// An attribute attached to a writer [`Element`].
#[derive(Clone, Debug)]
pub struct Attribute {
    pub namespace_uri: Option<String>,
    pub name: String,
    pub resource_id: Option<u32>,
    pub value: TypedValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        Attribute {
            namespace_uri: None,
            name: name.into(),
            resource_id: None,
            value: value.into(),
        }
    }

    pub fn with_namespace(
        uri: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<TypedValue>,
    ) -> Self {
        Attribute {
            namespace_uri: Some(uri.into()),
            name: name.into(),
            resource_id: None,
            value: value.into(),
        }
    }

    pub fn resource_id(mut self, id: u32) -> Self {
        self.resource_id = Some(id);
        self
    }
}

/// A writer-side element node.
#[derive(Clone, Debug, Default)]
pub struct Element {
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub line: u32,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Element>,
    pub text: Option<String>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Element {
            tag: tag.into(),
            ..Element::default()
        }
    }

    pub fn line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    pub fn attr(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Encodes this element tree as a complete `RES_XML_TYPE` document.
    /// `namespaces` is the list of `(prefix, uri)` declarations opened
    /// around the root element.
    pub fn encode_document(&self, namespaces: &[(String, String)]) -> ChunkResult<Vec<u8>> {
        let mut pool = PoolWriter::new();

        // Attribute names carrying resource ids must occupy the lowest pool
        // indices, parallel to the resource map chunk.
        let mut mapped: BTreeMap<u32, u32> = BTreeMap::new();
        collect_mapped_attribute_names(self, &mut pool, &mut mapped);
        let resource_map: Vec<u32> = (0..pool.len())
            .map(|i| mapped.get(&(i as u32)).copied().unwrap_or(0))
            .collect();

        for (prefix, uri) in namespaces {
            pool.intern(prefix);
            pool.intern(uri);
        }
        collect_element_strings(self, &mut pool);
        let pool_chunk = pool.to_chunk();

        let mut body = Vec::new();
        for (prefix, uri) in namespaces {
            write_namespace_chunk(&mut body, &pool, prefix, uri, true)?;
        }
        write_element_recursive(self, &mut body, &pool)?;
        for (prefix, uri) in namespaces.iter().rev() {
            write_namespace_chunk(&mut body, &pool, prefix, uri, false)?;
        }

        let mut document = Vec::new();
        let start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        document.extend_from_slice(&pool_chunk);
        if !resource_map.is_empty() {
            let map_start = begin_chunk(&mut document, RES_XML_RESOURCE_MAP_TYPE, 8);
            for id in &resource_map {
                write_u32(&mut document, *id);
            }
            finalize_chunk(&mut document, map_start);
        }
        document.extend_from_slice(&body);
        finalize_chunk(&mut document, start);
        Ok(document)
    }
}

/// Interning string-pool writer. Styled strings must be interned before any
/// unstyled ones, matching the compiler's layout rule.
pub struct PoolWriter {
    strings: Vec<String>,
    indices: BTreeMap<String, u32>,
    styles: Vec<Vec<StyleRun>>,
    utf8: bool,
}

impl PoolWriter {
    pub fn new() -> Self {
        PoolWriter {
            strings: Vec::new(),
            indices: BTreeMap::new(),
            styles: Vec::new(),
            utf8: false,
        }
    }

    pub fn utf8(mut self) -> Self {
        self.utf8 = true;
        self
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn intern(&mut self, value: impl AsRef<str>) -> u32 {
        let value = value.as_ref();
        if let Some(&idx) = self.indices.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        let owned = value.to_string();
        self.strings.push(owned.clone());
        self.indices.insert(owned, idx);
        idx
    }

    /// Interns a styled string. Returns its index; the style entry covers
    /// every string interned so far, so styled strings must come first.
    pub fn intern_styled(&mut self, value: impl AsRef<str>, runs: Vec<StyleRun>) -> u32 {
        let idx = self.intern(value);
        while self.styles.len() <= idx as usize {
            self.styles.push(Vec::new());
        }
        self.styles[idx as usize] = runs;
        idx
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.indices.get(value).copied()
    }

    pub fn to_chunk(&self) -> Vec<u8> {
        let string_count = self.strings.len() as u32;
        let style_count = self.styles.len() as u32;
        let header_size = 28u16;
        let strings_start = header_size as u32 + (string_count + style_count) * 4;

        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            if self.utf8 {
                write_utf8_string(&mut string_data, s);
            } else {
                write_utf16_string(&mut string_data, s);
            }
        }
        align_to_four(&mut string_data);

        let mut style_data = Vec::new();
        let mut style_offsets = Vec::with_capacity(self.styles.len());
        for (index, runs) in self.styles.iter().enumerate() {
            style_offsets.push(style_data.len() as u32);
            let text = self.strings.get(index).map(String::as_str).unwrap_or("");
            for run in runs {
                // Runs are kept as byte offsets; the compiled format
                // indexes UTF-16 code units.
                let (first, last) = if text.is_ascii() {
                    (run.first, run.last)
                } else {
                    let first = byte_to_utf16_unit(text, run.first as usize) as u32;
                    let end = byte_to_utf16_unit(text, run.last as usize + 1) as u32;
                    (first, end.saturating_sub(1))
                };
                write_u32(&mut style_data, run.tag);
                write_u32(&mut style_data, first);
                write_u32(&mut style_data, last);
            }
            write_u32(&mut style_data, SPAN_END);
        }
        if !style_data.is_empty() {
            // Trailing terminator pair, as the compiler emits.
            write_u32(&mut style_data, SPAN_END);
            write_u32(&mut style_data, SPAN_END);
        }

        let styles_start = if style_data.is_empty() {
            0
        } else {
            strings_start + string_data.len() as u32
        };

        let mut flags = 0u32;
        if self.utf8 {
            flags |= STRING_FLAG_UTF8;
        }

        let mut chunk = Vec::new();
        write_u16(&mut chunk, RES_STRING_POOL_TYPE);
        write_u16(&mut chunk, header_size);
        write_u32(&mut chunk, 0); // chunk size placeholder
        write_u32(&mut chunk, string_count);
        write_u32(&mut chunk, style_count);
        write_u32(&mut chunk, flags);
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, styles_start);
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        for offset in style_offsets {
            write_u32(&mut chunk, offset);
        }
        chunk.extend_from_slice(&string_data);
        chunk.extend_from_slice(&style_data);
        align_to_four(&mut chunk);
        let chunk_size = chunk.len() as u32;
        chunk[4..8].copy_from_slice(&chunk_size.to_le_bytes());
        chunk
    }
}

impl Default for PoolWriter {
    fn default() -> Self {
        PoolWriter::new()
    }
}

fn collect_mapped_attribute_names(
    element: &Element,
    pool: &mut PoolWriter,
    map: &mut BTreeMap<u32, u32>,
) {
    for attr in &element.attributes {
        if let Some(id) = attr.resource_id {
            let idx = pool.intern(&attr.name);
            map.insert(idx, id);
        }
    }
    for child in &element.children {
        collect_mapped_attribute_names(child, pool, map);
    }
}

fn collect_element_strings(element: &Element, pool: &mut PoolWriter) {
    pool.intern(&element.tag);
    if let Some(uri) = &element.namespace_uri {
        pool.intern(uri);
    }
    if let Some(text) = &element.text {
        pool.intern(text);
    }
    for attr in &element.attributes {
        pool.intern(&attr.name);
        if let Some(uri) = &attr.namespace_uri {
            pool.intern(uri);
        }
        if let TypedValue::Str(value) = &attr.value {
            pool.intern(value);
        }
    }
    for child in &element.children {
        collect_element_strings(child, pool);
    }
}

fn index_or_missing(pool: &PoolWriter, value: &str, what: &str) -> ChunkResult<u32> {
    pool.index_of(value)
        .ok_or_else(|| malformed(format!("missing {what} string")))
}

fn optional_index(pool: &PoolWriter, value: Option<&String>, what: &str) -> ChunkResult<u32> {
    match value {
        Some(v) => index_or_missing(pool, v, what),
        None => Ok(NO_ENTRY),
    }
}

fn write_namespace_chunk(
    buf: &mut Vec<u8>,
    pool: &PoolWriter,
    prefix: &str,
    uri: &str,
    is_start: bool,
) -> ChunkResult<()> {
    let chunk_type = if is_start {
        RES_XML_START_NAMESPACE_TYPE
    } else {
        RES_XML_END_NAMESPACE_TYPE
    };
    let start = begin_chunk(buf, chunk_type, 16);
    write_u32(buf, 0); // line number
    write_u32(buf, NO_ENTRY); // comment
    write_u32(buf, index_or_missing(pool, prefix, "namespace prefix")?);
    write_u32(buf, index_or_missing(pool, uri, "namespace URI")?);
    finalize_chunk(buf, start);
    Ok(())
}

fn write_element_recursive(
    element: &Element,
    buf: &mut Vec<u8>,
    pool: &PoolWriter,
) -> ChunkResult<()> {
    write_start_element(buf, element, pool)?;
    if let Some(text) = &element.text {
        write_cdata(buf, element.line, text, pool)?;
    }
    for child in &element.children {
        write_element_recursive(child, buf, pool)?;
    }
    write_end_element(buf, element, pool)?;
    Ok(())
}

fn write_start_element(
    buf: &mut Vec<u8>,
    element: &Element,
    pool: &PoolWriter,
) -> ChunkResult<()> {
    let start = begin_chunk(buf, RES_XML_START_ELEMENT_TYPE, 16);
    write_u32(buf, element.line);
    write_u32(buf, NO_ENTRY); // comment
    write_u32(
        buf,
        optional_index(pool, element.namespace_uri.as_ref(), "element namespace")?,
    );
    write_u32(buf, index_or_missing(pool, &element.tag, "element tag")?);
    write_u16(buf, 20); // attributeStart
    write_u16(buf, 20); // attributeSize
    write_u16(buf, element.attributes.len() as u16);
    write_u16(buf, 0); // idIndex
    write_u16(buf, 0); // classIndex
    write_u16(buf, 0); // styleIndex
    for attr in &element.attributes {
        write_attribute(buf, attr, pool)?;
    }
    finalize_chunk(buf, start);
    Ok(())
}

fn write_end_element(buf: &mut Vec<u8>, element: &Element, pool: &PoolWriter) -> ChunkResult<()> {
    let start = begin_chunk(buf, RES_XML_END_ELEMENT_TYPE, 16);
    write_u32(buf, element.line);
    write_u32(buf, NO_ENTRY);
    write_u32(
        buf,
        optional_index(pool, element.namespace_uri.as_ref(), "element namespace")?,
    );
    write_u32(buf, index_or_missing(pool, &element.tag, "element tag")?);
    finalize_chunk(buf, start);
    Ok(())
}

fn write_cdata(buf: &mut Vec<u8>, line: u32, text: &str, pool: &PoolWriter) -> ChunkResult<()> {
    let idx = index_or_missing(pool, text, "CDATA text")?;
    let start = begin_chunk(buf, RES_XML_CDATA_TYPE, 16);
    write_u32(buf, line);
    write_u32(buf, NO_ENTRY);
    write_u32(buf, idx);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, data_type::STRING);
    write_u32(buf, idx);
    finalize_chunk(buf, start);
    Ok(())
}

fn write_attribute(buf: &mut Vec<u8>, attr: &Attribute, pool: &PoolWriter) -> ChunkResult<()> {
    let ns_idx = optional_index(pool, attr.namespace_uri.as_ref(), "attribute namespace")?;
    let name_idx = index_or_missing(pool, &attr.name, "attribute name")?;
    let (raw_idx, data_type, data) = match &attr.value {
        TypedValue::Null => (NO_ENTRY, data_type::NULL, 0),
        TypedValue::Str(text) => {
            let idx = index_or_missing(pool, text, "attribute value")?;
            (idx, data_type::STRING, idx)
        }
        TypedValue::Boolean(flag) => (
            NO_ENTRY,
            data_type::INT_BOOLEAN,
            if *flag { 0xFFFF_FFFF } else { 0 },
        ),
        TypedValue::Int(num) => (NO_ENTRY, data_type::INT_DEC, *num as u32),
        TypedValue::Hex(num) => (NO_ENTRY, data_type::INT_HEX, *num),
        TypedValue::Float(num) => (NO_ENTRY, data_type::FLOAT, num.to_bits()),
        TypedValue::Reference(id) => (NO_ENTRY, data_type::REFERENCE, *id),
    };
    write_u32(buf, ns_idx);
    write_u32(buf, name_idx);
    write_u32(buf, raw_idx);
    write_u16(buf, 8);
    write_u8(buf, 0);
    write_u8(buf, data_type);
    write_u32(buf, data);
    Ok(())
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0); // placeholder for chunk size
    start
}

fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

fn write_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) {
    let char_len = text.chars().count();
    let byte_len = text.len();
    write_utf8_length(buf, char_len);
    write_utf8_length(buf, byte_len);
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        buf.push(0x80 | ((len >> 8) as u8 & 0x7F));
        buf.push((len & 0xFF) as u8);
    }
}

fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}
