//! Pull-style traversal over a decoded binary XML tree.
//!
//! An [`XmlBlock`] owns one decoded document (token stream plus string
//! pool) under an open count that starts at 1 for the block itself; every
//! [`BinaryXmlCursor`] created from it adds one. The underlying pool is
//! released when the count reaches zero, so cursors may outlive the block
//! that spawned them. One cursor is a strictly sequential, single-thread
//! state machine; concurrent cursors over the same block are fine.

use crate::chunk::{data_type, AttributeEntry, StartElement, Token, XmlTree, NO_ENTRY};
use crate::error::{position_description, XmlError, XmlResult};
use crate::string_pool::{RichText, StringPool};
use log::debug;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// XmlPullParser feature name for namespace processing.
pub const FEATURE_PROCESS_NAMESPACES: &str =
    "http://xmlpull.org/v1/doc/features.html#process-namespaces";
/// XmlPullParser feature name for reporting namespace attributes.
pub const FEATURE_REPORT_NAMESPACE_ATTRIBUTES: &str =
    "http://xmlpull.org/v1/doc/features.html#report-namespace-prefixes";

/// Pull-parser event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmlEvent {
    StartDocument,
    StartTag,
    EndTag,
    Text,
    EndDocument,
}

impl fmt::Display for XmlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XmlEvent::StartDocument => "START_DOCUMENT",
            XmlEvent::StartTag => "START_TAG",
            XmlEvent::EndTag => "END_TAG",
            XmlEvent::Text => "TEXT",
            XmlEvent::EndDocument => "END_DOCUMENT",
        };
        f.write_str(name)
    }
}

struct OpenState {
    count: usize,
    released: bool,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

struct BlockShared {
    tree: XmlTree,
    pool: StringPool,
    open: Mutex<OpenState>,
}

/// A decoded binary XML document shared by any number of cursors.
pub struct XmlBlock {
    shared: Arc<BlockShared>,
    closed: bool,
}

impl XmlBlock {
    /// Decodes a complete `RES_XML_TYPE` document.
    pub fn from_bytes(bytes: &[u8]) -> XmlResult<XmlBlock> {
        let (tree, pool) = XmlTree::decode(bytes)?;
        Ok(XmlBlock::new(tree, StringPool::new(Arc::new(pool))))
    }

    /// Wraps an already decoded tree and pool. The pool is closed when the
    /// block and every cursor created from it have been closed.
    pub fn new(tree: XmlTree, pool: StringPool) -> XmlBlock {
        XmlBlock {
            shared: Arc::new(BlockShared {
                tree,
                pool,
                open: Mutex::new(OpenState {
                    count: 1,
                    released: false,
                    on_release: None,
                }),
            }),
            closed: false,
        }
    }

    /// Registers a hook invoked once, when the open count reaches zero.
    /// Lets the owning asset container observe the release.
    pub fn on_release(&self, hook: Box<dyn FnOnce() + Send>) {
        let mut open = lock_open(&self.shared);
        open.on_release = Some(hook);
    }

    pub fn pool(&self) -> &StringPool {
        &self.shared.pool
    }

    /// Starts a new traversal over this document.
    pub fn cursor(&self) -> BinaryXmlCursor {
        {
            let mut open = lock_open(&self.shared);
            open.count += 1;
        }
        BinaryXmlCursor {
            shared: Arc::clone(&self.shared),
            pos: 0,
            current: None,
            event: XmlEvent::StartDocument,
            started: false,
            depth: 0,
            dec_next_depth: false,
            closed: false,
        }
    }

    /// Drops the block's own reference. Idempotent; the underlying tree is
    /// released once the last cursor closes too.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            dec_open(&self.shared);
        }
    }
}

impl Drop for XmlBlock {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_open(shared: &BlockShared) -> std::sync::MutexGuard<'_, OpenState> {
    shared.open.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dec_open(shared: &Arc<BlockShared>) {
    let hook = {
        let mut open = lock_open(shared);
        if open.count == 0 {
            return;
        }
        open.count -= 1;
        if open.count > 0 || open.released {
            return;
        }
        open.released = true;
        open.on_release.take()
    };
    shared.pool.close();
    debug!("binary XML block released");
    if let Some(hook) = hook {
        hook();
    }
}

/// Forward-only pull parser over one [`XmlBlock`].
pub struct BinaryXmlCursor {
    shared: Arc<BlockShared>,
    /// Index of the next token to consume.
    pos: usize,
    /// Token index of the current START_TAG / END_TAG / TEXT event.
    current: Option<usize>,
    event: XmlEvent,
    started: bool,
    depth: usize,
    dec_next_depth: bool,
    closed: bool,
}

impl BinaryXmlCursor {
    /// Advances to the next event. The first call reports START_DOCUMENT
    /// without consuming anything; reaching the end of the tree reports
    /// END_DOCUMENT and closes the cursor.
    pub fn next(&mut self) -> XmlResult<XmlEvent> {
        if self.closed {
            self.event = XmlEvent::EndDocument;
            return Ok(XmlEvent::EndDocument);
        }
        if !self.started {
            self.started = true;
            self.event = XmlEvent::StartDocument;
            return Ok(XmlEvent::StartDocument);
        }
        // Deferred decrement: depth still includes the element whose
        // END_TAG was just reported, until this advance.
        if self.dec_next_depth {
            self.depth -= 1;
            self.dec_next_depth = false;
        }
        loop {
            if self.pos >= self.shared.tree.tokens.len() {
                self.event = XmlEvent::EndDocument;
                self.close();
                return Ok(XmlEvent::EndDocument);
            }
            let index = self.pos;
            self.pos += 1;
            match &self.shared.tree.tokens[index] {
                Token::StartNamespace { .. } | Token::EndNamespace => continue,
                Token::StartElement(_) => {
                    self.current = Some(index);
                    self.depth += 1;
                    self.event = XmlEvent::StartTag;
                    return Ok(XmlEvent::StartTag);
                }
                Token::EndElement { .. } => {
                    self.current = Some(index);
                    self.dec_next_depth = true;
                    self.event = XmlEvent::EndTag;
                    return Ok(XmlEvent::EndTag);
                }
                Token::Text { .. } => {
                    self.current = Some(index);
                    self.event = XmlEvent::Text;
                    return Ok(XmlEvent::Text);
                }
            }
        }
    }

    /// Advances to the next START_TAG or END_TAG, skipping one intervening
    /// whitespace-only TEXT event.
    pub fn next_tag(&mut self) -> XmlResult<XmlEvent> {
        let mut event = self.next()?;
        if event == XmlEvent::Text && self.is_whitespace_text()? {
            event = self.next()?;
        }
        if event != XmlEvent::StartTag && event != XmlEvent::EndTag {
            return Err(XmlError::parser(
                format!("expected start or end tag, found {event}"),
                self.line_number(),
            ));
        }
        Ok(event)
    }

    /// Reads the text content of the current element: requires
    /// START_TAG, then TEXT followed by END_TAG (returns the text) or an
    /// immediate END_TAG (returns the empty string).
    pub fn next_text(&mut self) -> XmlResult<String> {
        if self.event != XmlEvent::StartTag {
            return Err(XmlError::parser(
                "parser must be on START_TAG to read next text",
                self.line_number(),
            ));
        }
        match self.next()? {
            XmlEvent::Text => {
                let result = self.text()?.unwrap_or_default();
                if self.next()? != XmlEvent::EndTag {
                    return Err(XmlError::parser(
                        "event TEXT must be immediately followed by END_TAG",
                        self.line_number(),
                    ));
                }
                Ok(result)
            }
            XmlEvent::EndTag => Ok(String::new()),
            other => Err(XmlError::parser(
                format!("parser must be on START_TAG or TEXT to read text, found {other}"),
                self.line_number(),
            )),
        }
    }

    /// Fails unless the current event (and, when given, namespace and
    /// name) match the arguments.
    pub fn require(
        &self,
        event: XmlEvent,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> XmlResult<()> {
        let mut ok = event == self.event;
        if ok {
            if let Some(ns) = namespace {
                ok = self.namespace()? == ns;
            }
        }
        if ok {
            if let Some(n) = name {
                ok = self.name()?.as_deref() == Some(n);
            }
        }
        if ok {
            Ok(())
        } else {
            Err(XmlError::parser(
                format!("expected {event}"),
                self.line_number(),
            ))
        }
    }

    pub fn event_type(&self) -> XmlEvent {
        self.event
    }

    /// Element nesting depth. Immediately after an END_TAG this still
    /// reports the depth of the element just closed.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Tag name at START_TAG / END_TAG, `None` for other events.
    pub fn name(&self) -> XmlResult<Option<String>> {
        match self.current_token() {
            Some(Token::StartElement(start)) => self.pooled(start.name),
            Some(Token::EndElement { name, .. }) => self.pooled(*name),
            _ => Ok(None),
        }
    }

    /// Namespace URI of the current tag, or the empty string.
    pub fn namespace(&self) -> XmlResult<String> {
        let ns = match self.current_token() {
            Some(Token::StartElement(start)) => start.ns,
            Some(Token::EndElement { ns, .. }) => *ns,
            _ => NO_ENTRY,
        };
        Ok(self.pooled(ns)?.unwrap_or_default())
    }

    /// Text at a TEXT event, `None` otherwise.
    pub fn text(&self) -> XmlResult<Option<String>> {
        Ok(self.rich_text()?.map(|t| t.text().to_string()))
    }

    /// Text at a TEXT event with any inline spans the pool carries.
    pub fn rich_text(&self) -> XmlResult<Option<RichText>> {
        let Some(Token::Text {
            data_index,
            data_type: dt,
            data,
            ..
        }) = self.current_token()
        else {
            return Ok(None);
        };
        let index = if *data_index != NO_ENTRY {
            *data_index
        } else if *dt == data_type::STRING {
            *data
        } else {
            return Ok(None);
        };
        Ok(Some(self.shared.pool.get(index as usize)?))
    }

    pub fn is_whitespace_text(&self) -> XmlResult<bool> {
        match self.text()? {
            Some(text) => Ok(text.chars().all(char::is_whitespace)),
            None => Err(XmlError::parser(
                "not on a TEXT event",
                self.line_number(),
            )),
        }
    }

    /// Source line recorded by the compiler for the current event, or -1.
    pub fn line_number(&self) -> i32 {
        match self.current_token() {
            Some(Token::StartElement(start)) => start.line as i32,
            Some(Token::EndElement { line, .. }) | Some(Token::Text { line, .. }) => *line as i32,
            _ => -1,
        }
    }

    /// Column numbers are not tracked.
    pub fn column_number(&self) -> i32 {
        -1
    }

    pub fn position_description(&self) -> String {
        position_description(self.line_number())
    }

    // -- Attribute access by index -------------------------------------

    /// Number of attributes on the current START_TAG, 0 otherwise.
    pub fn attribute_count(&self) -> usize {
        match self.current_token() {
            Some(Token::StartElement(start)) if self.event == XmlEvent::StartTag => {
                start.attributes.len()
            }
            _ => 0,
        }
    }

    pub fn attribute_namespace(&self, index: usize) -> XmlResult<String> {
        let attr = self.attribute(index)?;
        Ok(self.pooled(attr.ns)?.unwrap_or_default())
    }

    pub fn attribute_name(&self, index: usize) -> XmlResult<String> {
        let attr = self.attribute(index)?;
        Ok(self.pooled(attr.name)?.unwrap_or_default())
    }

    /// Resource identifier associated with the attribute name, or 0.
    pub fn attribute_name_resource(&self, index: usize) -> XmlResult<u32> {
        let attr = self.attribute(index)?;
        Ok(self
            .shared
            .tree
            .resource_map
            .get(attr.name as usize)
            .copied()
            .unwrap_or(0))
    }

    /// String form of the attribute value: the pooled raw string when one
    /// exists, otherwise the typed data coerced to text.
    pub fn attribute_value(&self, index: usize) -> XmlResult<String> {
        let attr = self.attribute(index)?;
        if attr.raw != NO_ENTRY {
            if let Some(text) = self.pooled(attr.raw)? {
                return Ok(text);
            }
        }
        match attr.data_type {
            data_type::NULL => Err(XmlError::IndexOutOfRange(index)),
            data_type::STRING => Ok(self
                .pooled(attr.data)?
                .ok_or(XmlError::IndexOutOfRange(index))?),
            other => {
                coerce_to_string(other, attr.data).ok_or(XmlError::IndexOutOfRange(index))
            }
        }
    }

    pub fn attribute_data_type(&self, index: usize) -> XmlResult<u8> {
        Ok(self.attribute(index)?.data_type)
    }

    pub fn attribute_data(&self, index: usize) -> XmlResult<u32> {
        Ok(self.attribute(index)?.data)
    }

    pub fn attribute_bool(&self, index: usize, default: bool) -> XmlResult<bool> {
        let attr = self.attribute(index)?;
        Ok(if is_int_type(attr.data_type) {
            attr.data != 0
        } else {
            default
        })
    }

    pub fn attribute_int(&self, index: usize, default: i32) -> XmlResult<i32> {
        let attr = self.attribute(index)?;
        Ok(if is_int_type(attr.data_type) {
            attr.data as i32
        } else {
            default
        })
    }

    pub fn attribute_unsigned_int(&self, index: usize, default: u32) -> XmlResult<u32> {
        let attr = self.attribute(index)?;
        Ok(if is_int_type(attr.data_type) {
            attr.data
        } else {
            default
        })
    }

    pub fn attribute_resource(&self, index: usize, default: u32) -> XmlResult<u32> {
        let attr = self.attribute(index)?;
        Ok(if attr.data_type == data_type::REFERENCE {
            attr.data
        } else {
            default
        })
    }

    /// Unlike the other typed getters this one fails on a type mismatch.
    /// Long-standing asymmetry in the interface; callers depend on it.
    pub fn attribute_float(&self, index: usize) -> XmlResult<f32> {
        let attr = self.attribute(index)?;
        if attr.data_type == data_type::FLOAT {
            Ok(f32::from_bits(attr.data))
        } else {
            Err(XmlError::parser(
                format!("attribute at index {index} is not a float"),
                self.line_number(),
            ))
        }
    }

    // -- Attribute access by namespace + name ---------------------------

    /// Linear lookup; `None` when absent rather than an error.
    pub fn attribute_index(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> XmlResult<Option<usize>> {
        let start = self.start_element()?;
        for (i, attr) in start.attributes.iter().enumerate() {
            if self.pooled(attr.name)?.as_deref() != Some(name) {
                continue;
            }
            let ns_matches = match namespace {
                Some(ns) => self.pooled(attr.ns)?.as_deref() == Some(ns),
                None => attr.ns == NO_ENTRY,
            };
            if ns_matches {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    pub fn attribute_value_by_name(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> XmlResult<Option<String>> {
        match self.attribute_index(namespace, name)? {
            Some(index) => self.attribute_value(index).map(Some),
            None => Ok(None),
        }
    }

    pub fn attribute_bool_by_name(
        &self,
        namespace: Option<&str>,
        name: &str,
        default: bool,
    ) -> XmlResult<bool> {
        match self.attribute_index(namespace, name)? {
            Some(index) => self.attribute_bool(index, default),
            None => Ok(default),
        }
    }

    pub fn attribute_int_by_name(
        &self,
        namespace: Option<&str>,
        name: &str,
        default: i32,
    ) -> XmlResult<i32> {
        match self.attribute_index(namespace, name)? {
            Some(index) => self.attribute_int(index, default),
            None => Ok(default),
        }
    }

    pub fn attribute_unsigned_int_by_name(
        &self,
        namespace: Option<&str>,
        name: &str,
        default: u32,
    ) -> XmlResult<u32> {
        match self.attribute_index(namespace, name)? {
            Some(index) => self.attribute_unsigned_int(index, default),
            None => Ok(default),
        }
    }

    pub fn attribute_resource_by_name(
        &self,
        namespace: Option<&str>,
        name: &str,
        default: u32,
    ) -> XmlResult<u32> {
        match self.attribute_index(namespace, name)? {
            Some(index) => self.attribute_resource(index, default),
            None => Ok(default),
        }
    }

    /// By-name float lookup uses the default on a type mismatch, unlike
    /// the by-index accessor.
    pub fn attribute_float_by_name(
        &self,
        namespace: Option<&str>,
        name: &str,
        default: f32,
    ) -> XmlResult<f32> {
        match self.attribute_index(namespace, name)? {
            Some(index) => {
                let attr = self.attribute(index)?;
                Ok(if attr.data_type == data_type::FLOAT {
                    f32::from_bits(attr.data)
                } else {
                    default
                })
            }
            None => Ok(default),
        }
    }

    // -- Well-known element attributes ----------------------------------

    pub fn id_attribute(&self) -> XmlResult<Option<String>> {
        let start = self.start_element()?;
        match start.id_index {
            0 => Ok(None),
            index => self.attribute_value(index as usize - 1).map(Some),
        }
    }

    pub fn class_attribute(&self) -> XmlResult<Option<String>> {
        let start = self.start_element()?;
        match start.class_index {
            0 => Ok(None),
            index => self.attribute_value(index as usize - 1).map(Some),
        }
    }

    /// Resource id of the style attribute, or 0.
    pub fn style_attribute_resource(&self) -> XmlResult<u32> {
        let start = self.start_element()?;
        if start.style_index == 0 {
            return Ok(0);
        }
        let attr = start
            .attributes
            .get(start.style_index as usize - 1)
            .copied()
            .ok_or(XmlError::IndexOutOfRange(start.style_index as usize - 1))?;
        Ok(match attr.data_type {
            data_type::REFERENCE | data_type::ATTRIBUTE => attr.data,
            t if is_int_type(t) => attr.data,
            _ => 0,
        })
    }

    // -- Features and rejected operations --------------------------------

    /// Namespace processing and namespace-attribute reporting are always
    /// on; everything else reads as off.
    pub fn feature(&self, name: &str) -> bool {
        name == FEATURE_PROCESS_NAMESPACES || name == FEATURE_REPORT_NAMESPACE_ATTRIBUTES
    }

    pub fn set_feature(&mut self, name: &str, state: bool) -> XmlResult<()> {
        if state
            && (name == FEATURE_PROCESS_NAMESPACES
                || name == FEATURE_REPORT_NAMESPACE_ATTRIBUTES)
        {
            Ok(())
        } else {
            Err(XmlError::Unsupported("setFeature"))
        }
    }

    /// The tree is pre-parsed; no input can be supplied.
    pub fn set_input(&mut self, _input: &str) -> XmlResult<()> {
        Err(XmlError::Unsupported("setInput"))
    }

    pub fn define_entity_replacement_text(
        &mut self,
        _entity: &str,
        _replacement: &str,
    ) -> XmlResult<()> {
        Err(XmlError::Unsupported("defineEntityReplacementText"))
    }

    pub fn set_property(&mut self, _name: &str) -> XmlResult<()> {
        Err(XmlError::Unsupported("setProperty"))
    }

    pub fn namespace_prefix(&self, _pos: usize) -> XmlResult<String> {
        Err(XmlError::Unsupported("getNamespacePrefix"))
    }

    pub fn namespace_uri(&self, _pos: usize) -> XmlResult<String> {
        Err(XmlError::Unsupported("getNamespaceUri"))
    }

    pub fn namespace_count(&self, _depth: usize) -> XmlResult<usize> {
        Err(XmlError::Unsupported("getNamespaceCount"))
    }

    /// Releases this cursor's reference to the shared tree. Idempotent;
    /// called automatically when END_DOCUMENT is reached or the cursor is
    /// dropped.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            dec_open(&self.shared);
        }
    }

    // -- Internals --------------------------------------------------------

    fn current_token(&self) -> Option<&Token> {
        self.current
            .and_then(|index| self.shared.tree.tokens.get(index))
    }

    fn start_element(&self) -> XmlResult<&StartElement> {
        match self.current_token() {
            Some(Token::StartElement(start)) if self.event == XmlEvent::StartTag => Ok(start),
            _ => Err(XmlError::parser(
                "parser is not positioned on a START_TAG",
                self.line_number(),
            )),
        }
    }

    fn attribute(&self, index: usize) -> XmlResult<AttributeEntry> {
        self.start_element()?
            .attributes
            .get(index)
            .copied()
            .ok_or(XmlError::IndexOutOfRange(index))
    }

    fn pooled(&self, index: u32) -> XmlResult<Option<String>> {
        if index == NO_ENTRY {
            return Ok(None);
        }
        Ok(Some(
            self.shared.pool.get(index as usize)?.text().to_string(),
        ))
    }
}

impl Drop for BinaryXmlCursor {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_int_type(t: u8) -> bool {
    (data_type::FIRST_INT..=data_type::LAST_INT).contains(&t)
}

/// Text form of a typed value without a pooled raw string, mirroring the
/// standard coercion table.
fn coerce_to_string(t: u8, data: u32) -> Option<String> {
    match t {
        data_type::NULL => None,
        data_type::REFERENCE => Some(format!("@{data}")),
        data_type::ATTRIBUTE => Some(format!("?{data}")),
        data_type::FLOAT => Some(f32::from_bits(data).to_string()),
        data_type::INT_HEX => Some(format!("0x{data:x}")),
        data_type::INT_BOOLEAN => Some(if data != 0 { "true" } else { "false" }.to_string()),
        t if (data_type::FIRST_COLOR_INT..=data_type::LAST_COLOR_INT).contains(&t) => {
            Some(format!("#{data:08x}"))
        }
        t if is_int_type(t) => Some((data as i32).to_string()),
        _ => None,
    }
}
