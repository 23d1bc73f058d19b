//! Lazy, memoizing projection of a decoded string pool into rich text.
//!
//! A compiled pool stores plain UTF strings plus optional inline style runs
//! (`<b>`, `<font;...>` and friends, flattened by the resource compiler into
//! `(tag, first, last)` triples). [`StringPool::get`] materializes the
//! rich-text value for an index on first access and reuses it for the
//! lifetime of the pool. Malformed markup is never an error here: bad
//! colors fall back to opaque black, bad numbers are ignored, unknown tags
//! are skipped. Worst case is a visually wrong span.

use crate::chunk::ChunkResult;
use crate::error::{XmlError, XmlResult};
use log::{debug, warn};
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pools larger than this use a sparse map instead of a dense slot array.
/// A memory/time trade-off, not a correctness boundary.
const SPARSE_POOL_THRESHOLD: usize = 250;

/// Opaque black, the fallback for unparseable color literals.
pub const OPAQUE_BLACK: u32 = 0xFF00_0000;

/// One inline style run attached to a pooled string. `tag` is the pool
/// index of the tag's own string; `first..=last` is the covered range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleRun {
    pub tag: u32,
    pub first: u32,
    pub last: u32,
}

/// Read access to a decoded pool. Implemented by the real chunk decoder
/// and by instrumented fakes in tests.
pub trait PoolSource: Send + Sync {
    fn len(&self) -> usize;
    fn string_at(&self, index: usize) -> ChunkResult<String>;
    fn style_runs_at(&self, index: usize) -> ChunkResult<Vec<StyleRun>>;
}

/// A system color resource resolved from an `@name` markup reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemColor {
    pub resource_id: u32,
    pub argb: u32,
}

/// Resolves `@name` color references found inside style markup.
pub trait ColorResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<SystemColor>;
}

/// A single styling instruction over `[start, end)` byte offsets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Span {
    Bold,
    Italic,
    Underline,
    Monospace,
    RelativeSize(f32),
    Subscript,
    Superscript,
    Strikethrough,
    Bullet,
    Marquee,
    AbsoluteSize(u32),
    Typeface(String),
    ForegroundColor(u32),
    BackgroundColor(u32),
    TextAppearance(u32),
    LineHeight(u32),
    Link(String),
    Annotation { key: String, value: String },
}

/// A [`Span`] positioned over a byte range of the owning text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpanRun {
    pub span: Span,
    pub start: usize,
    pub end: usize,
}

/// Text that carried style runs, with the expanded spans.
#[derive(Clone, Debug, PartialEq)]
pub struct StyledText {
    pub text: String,
    pub spans: Vec<SpanRun>,
}

/// A materialized pool entry. Entries without style runs stay plain and
/// allocate no styled wrapper.
#[derive(Clone, Debug, PartialEq)]
pub enum RichText {
    Plain(Arc<str>),
    Styled(Arc<StyledText>),
}

impl RichText {
    pub fn text(&self) -> &str {
        match self {
            RichText::Plain(text) => text,
            RichText::Styled(styled) => &styled.text,
        }
    }

    pub fn spans(&self) -> &[SpanRun] {
        match self {
            RichText::Plain(_) => &[],
            RichText::Styled(styled) => &styled.spans,
        }
    }
}

/// Recognized style tag, resolved once per distinct tag index and cached.
#[derive(Clone, Debug, PartialEq)]
enum TagKind {
    Bold,
    Italic,
    Underline,
    Monospace,
    Big,
    Small,
    Subscript,
    Superscript,
    Strikethrough,
    ListItem,
    Marquee,
    Font(FontTag),
    Anchor { href: Option<String> },
    Annotation(Vec<(String, String)>),
    Unknown,
}

/// Parsed sub-attributes of a `font;...` tag.
#[derive(Clone, Debug, Default, PartialEq)]
struct FontTag {
    height: Option<u32>,
    size: Option<u32>,
    foreground: Option<ColorSpec>,
    background: Option<ColorSpec>,
    face: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColorSpec {
    /// System color resource; rendered as a text-appearance span.
    Appearance(u32),
    /// Flat ARGB value.
    Argb(u32),
}

enum Slots {
    Dense(Vec<Option<RichText>>),
    Sparse(HashMap<usize, RichText>),
}

impl Slots {
    fn for_pool(size: usize, sparse_enabled: bool) -> Slots {
        if sparse_enabled && size > SPARSE_POOL_THRESHOLD {
            Slots::Sparse(HashMap::new())
        } else {
            Slots::Dense(vec![None; size])
        }
    }

    fn get(&self, index: usize) -> Option<&RichText> {
        match self {
            Slots::Dense(entries) => entries.get(index).and_then(Option::as_ref),
            Slots::Sparse(entries) => entries.get(&index),
        }
    }

    fn set(&mut self, index: usize, value: RichText) {
        match self {
            Slots::Dense(entries) => {
                if let Some(slot) = entries.get_mut(index) {
                    *slot = Some(value);
                }
            }
            Slots::Sparse(entries) => {
                entries.insert(index, value);
            }
        }
    }
}

struct PoolState {
    entries: Option<Slots>,
    tags: HashMap<u32, TagKind>,
    closed: bool,
}

/// The lazy rich-text projection over a [`PoolSource`].
///
/// Safe for concurrent `get` from multiple threads; the whole
/// populate-and-memoize sequence for an index runs under the pool's lock,
/// so an entry is constructed exactly once.
pub struct StringPool {
    source: Arc<dyn PoolSource>,
    resolver: Option<Arc<dyn ColorResolver>>,
    sparse_enabled: bool,
    state: Mutex<PoolState>,
}

impl StringPool {
    pub fn new(source: Arc<dyn PoolSource>) -> Self {
        StringPool {
            source,
            resolver: None,
            sparse_enabled: true,
            state: Mutex::new(PoolState {
                entries: None,
                tags: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Attaches the system color resolver used for `@name` references in
    /// style markup. Without one, such references are skipped.
    pub fn resolver(mut self, resolver: Arc<dyn ColorResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Forces dense slot storage regardless of pool size.
    pub fn dense_only(mut self) -> Self {
        self.sparse_enabled = false;
        self
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.len() == 0
    }

    /// Returns the rich-text value at `index`, materializing and memoizing
    /// it on first access.
    pub fn get(&self, index: usize) -> XmlResult<RichText> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(XmlError::PoolClosed);
        }
        if let Some(slots) = &state.entries {
            if let Some(hit) = slots.get(index) {
                return Ok(hit.clone());
            }
        }

        let text = self.source.string_at(index)?;
        let runs = self.source.style_runs_at(index)?;
        let value = if runs.is_empty() {
            RichText::Plain(Arc::from(text))
        } else {
            let styled = self.expand_runs(text, &runs, &mut state.tags)?;
            RichText::Styled(Arc::new(styled))
        };

        let source_len = self.source.len();
        let sparse_enabled = self.sparse_enabled;
        let slots = state
            .entries
            .get_or_insert_with(|| Slots::for_pool(source_len, sparse_enabled));
        slots.set(index, value.clone());
        Ok(value)
    }

    /// Releases the memoized entries. Idempotent; subsequent `get` calls
    /// fail with [`XmlError::PoolClosed`].
    pub fn close(&self) {
        let mut state = self.lock_state();
        if !state.closed {
            state.closed = true;
            state.entries = None;
            state.tags.clear();
            debug!("string pool with {} entries closed", self.source.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expand_runs(
        &self,
        text: String,
        runs: &[StyleRun],
        tags: &mut HashMap<u32, TagKind>,
    ) -> XmlResult<StyledText> {
        let mut spans = Vec::new();
        for run in runs {
            let kind = resolve_tag(tags, run.tag, self.source.as_ref(), self.resolver.as_deref())?;
            // Source ranges are inclusive-inclusive; spans are [start, end).
            let start = run.first as usize;
            let end = run.last as usize + 1;
            let (start, end) = clamp_range(start, end, text.len());
            apply_tag(&kind, &text, start, end, &mut spans);
        }
        Ok(StyledText { text, spans })
    }
}

fn clamp_range(start: usize, end: usize, len: usize) -> (usize, usize) {
    let start = start.min(len);
    let end = end.clamp(start, len);
    (start, end)
}

fn resolve_tag(
    cache: &mut HashMap<u32, TagKind>,
    tag: u32,
    source: &dyn PoolSource,
    resolver: Option<&dyn ColorResolver>,
) -> XmlResult<TagKind> {
    if let Some(kind) = cache.get(&tag) {
        return Ok(kind.clone());
    }
    let raw = source.string_at(tag as usize)?;
    let kind = classify_tag(&raw, resolver);
    if kind == TagKind::Unknown {
        warn!("unrecognized style tag '{raw}'");
    }
    cache.insert(tag, kind.clone());
    Ok(kind)
}

fn classify_tag(raw: &str, resolver: Option<&dyn ColorResolver>) -> TagKind {
    match raw {
        "b" => TagKind::Bold,
        "i" => TagKind::Italic,
        "u" => TagKind::Underline,
        "tt" => TagKind::Monospace,
        "big" => TagKind::Big,
        "small" => TagKind::Small,
        "sub" => TagKind::Subscript,
        "sup" => TagKind::Superscript,
        "strike" => TagKind::Strikethrough,
        "li" => TagKind::ListItem,
        "marquee" => TagKind::Marquee,
        _ => {
            if raw.starts_with("font;") {
                parse_font_tag(raw, resolver)
            } else if raw.starts_with("a;") {
                TagKind::Anchor {
                    href: sub_attributes(raw)
                        .find(|(key, _)| *key == "href")
                        .map(|(_, value)| value.to_string()),
                }
            } else if raw.starts_with("annotation;") {
                TagKind::Annotation(
                    sub_attributes(raw)
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect(),
                )
            } else {
                TagKind::Unknown
            }
        }
    }
}

/// Iterates the `key=value` pairs of a structured tag such as
/// `font;height=12;face=serif`.
fn sub_attributes(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    raw.split(';').skip(1).filter_map(|part| part.split_once('='))
}

fn parse_font_tag(raw: &str, resolver: Option<&dyn ColorResolver>) -> TagKind {
    let mut font = FontTag::default();
    for (key, value) in sub_attributes(raw) {
        match key {
            "height" => match value.parse::<u32>() {
                Ok(height) if height > 0 => font.height = Some(height),
                _ => warn!("ignoring bad font height '{value}'"),
            },
            "size" => match value.parse::<u32>() {
                Ok(size) if size > 0 => font.size = Some(size),
                _ => warn!("ignoring bad font size '{value}'"),
            },
            "fgcolor" | "color" => font.foreground = parse_color_spec(value, resolver, true),
            "bgcolor" => font.background = parse_color_spec(value, resolver, false),
            "face" => font.face = Some(value.to_string()),
            _ => warn!("ignoring unknown font sub-attribute '{key}'"),
        }
    }
    TagKind::Font(font)
}

fn parse_color_spec(
    value: &str,
    resolver: Option<&dyn ColorResolver>,
    foreground: bool,
) -> Option<ColorSpec> {
    if let Some(name) = value.strip_prefix('@') {
        match resolver.and_then(|r| r.resolve(name)) {
            Some(color) if foreground => Some(ColorSpec::Appearance(color.resource_id)),
            Some(color) => Some(ColorSpec::Argb(color.argb)),
            None => {
                warn!("could not resolve color resource '@{name}'");
                None
            }
        }
    } else {
        Some(ColorSpec::Argb(parse_color_literal(value)))
    }
}

fn apply_tag(kind: &TagKind, text: &str, start: usize, end: usize, spans: &mut Vec<SpanRun>) {
    let mut push = |span: Span, start: usize, end: usize| {
        spans.push(SpanRun { span, start, end });
    };
    match kind {
        TagKind::Bold => push(Span::Bold, start, end),
        TagKind::Italic => push(Span::Italic, start, end),
        TagKind::Underline => push(Span::Underline, start, end),
        TagKind::Monospace => push(Span::Monospace, start, end),
        TagKind::Big => push(Span::RelativeSize(1.25), start, end),
        TagKind::Small => push(Span::RelativeSize(0.8), start, end),
        TagKind::Subscript => push(Span::Subscript, start, end),
        TagKind::Superscript => push(Span::Superscript, start, end),
        TagKind::Strikethrough => push(Span::Strikethrough, start, end),
        TagKind::Marquee => push(Span::Marquee, start, end),
        TagKind::ListItem => {
            let (start, end) = extend_paragraph(text, start, end);
            push(Span::Bullet, start, end);
        }
        TagKind::Font(font) => {
            if let Some(height) = font.height {
                let (start, end) = extend_paragraph(text, start, end);
                push(Span::LineHeight(height), start, end);
            }
            if let Some(size) = font.size {
                push(Span::AbsoluteSize(size), start, end);
            }
            match font.foreground {
                Some(ColorSpec::Appearance(id)) => push(Span::TextAppearance(id), start, end),
                Some(ColorSpec::Argb(color)) => push(Span::ForegroundColor(color), start, end),
                None => {}
            }
            match font.background {
                Some(ColorSpec::Appearance(id)) => push(Span::TextAppearance(id), start, end),
                Some(ColorSpec::Argb(color)) => push(Span::BackgroundColor(color), start, end),
                None => {}
            }
            if let Some(face) = &font.face {
                push(Span::Typeface(face.clone()), start, end);
            }
        }
        TagKind::Anchor { href } => {
            if let Some(href) = href {
                push(Span::Link(href.clone()), start, end);
            }
        }
        TagKind::Annotation(pairs) => {
            for (key, value) in pairs {
                push(
                    Span::Annotation {
                        key: key.clone(),
                        value: value.clone(),
                    },
                    start,
                    end,
                );
            }
        }
        TagKind::Unknown => {}
    }
}

/// Widens `[start, end)` to the enclosing newline-delimited paragraph.
/// Upstream translation tooling routinely damages paragraph-span
/// boundaries, so they are repaired here rather than trusted.
fn extend_paragraph(text: &str, start: usize, end: usize) -> (usize, usize) {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut start = start.min(len);
    let mut end = end.min(len);
    if start != 0 && start != len && bytes[start - 1] != b'\n' {
        start -= 1;
        while start > 0 && bytes[start - 1] != b'\n' {
            start -= 1;
        }
    }
    if end != 0 && end != len && bytes[end] != b'\n' {
        end += 1;
        while end < len && bytes[end] != b'\n' {
            end += 1;
        }
    }
    (start, end)
}

static NAMED_COLORS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    HashMap::from([
        ("black", 0xFF00_0000),
        ("darkgray", 0xFF44_4444),
        ("darkgrey", 0xFF44_4444),
        ("gray", 0xFF88_8888),
        ("grey", 0xFF88_8888),
        ("lightgray", 0xFFCC_CCCC),
        ("lightgrey", 0xFFCC_CCCC),
        ("white", 0xFFFF_FFFF),
        ("red", 0xFFFF_0000),
        ("green", 0xFF00_FF00),
        ("blue", 0xFF00_00FF),
        ("yellow", 0xFFFF_FF00),
        ("cyan", 0xFF00_FFFF),
        ("aqua", 0xFF00_FFFF),
        ("magenta", 0xFFFF_00FF),
        ("fuchsia", 0xFFFF_00FF),
        ("lime", 0xFF00_FF00),
        ("maroon", 0xFF80_0000),
        ("navy", 0xFF00_0080),
        ("olive", 0xFF80_8000),
        ("purple", 0xFF80_0080),
        ("silver", 0xFFC0_C0C0),
        ("teal", 0xFF00_8080),
    ])
});

/// Parses a `#hex` or named color literal. Invalid input yields opaque
/// black rather than an error.
pub fn parse_color_literal(value: &str) -> u32 {
    if let Some(hex) = value.strip_prefix('#') {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return OPAQUE_BLACK;
        }
        let nibble = |i: usize| u32::from_str_radix(&hex[i..i + 1], 16).unwrap_or(0);
        match hex.len() {
            3 => {
                let (r, g, b) = (nibble(0) * 17, nibble(1) * 17, nibble(2) * 17);
                0xFF00_0000 | (r << 16) | (g << 8) | b
            }
            4 => {
                let (a, r, g, b) = (nibble(0) * 17, nibble(1) * 17, nibble(2) * 17, nibble(3) * 17);
                (a << 24) | (r << 16) | (g << 8) | b
            }
            6 => u32::from_str_radix(hex, 16)
                .map(|rgb| 0xFF00_0000 | rgb)
                .unwrap_or(OPAQUE_BLACK),
            8 => u32::from_str_radix(hex, 16).unwrap_or(OPAQUE_BLACK),
            _ => OPAQUE_BLACK,
        }
    } else {
        NAMED_COLORS
            .get(value.to_ascii_lowercase().as_str())
            .copied()
            .unwrap_or(OPAQUE_BLACK)
    }
}

/// Integer font metrics in the usual convention: ascent/top are negative
/// offsets above the baseline, descent/bottom positive below it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FontMetrics {
    pub top: i32,
    pub ascent: i32,
    pub descent: i32,
    pub bottom: i32,
}

/// Probe measurements of a reference capital glyph rendered at text size
/// 100: the glyph bounding-box top and the font ascent, both negative.
#[derive(Clone, Copy, Debug)]
pub struct FontProbe {
    pub glyph_top: f32,
    pub ascent: f32,
}

static CAP_PROPORTION: OnceCell<f32> = OnceCell::new();

/// Installs the probe used to derive the minimum visual ascent for
/// [`choose_height`]. Only the first installation wins; returns whether
/// this call set it.
pub fn set_font_probe(probe: FontProbe) -> bool {
    CAP_PROPORTION.set(probe.glyph_top / probe.ascent).is_ok()
}

fn cap_proportion() -> f32 {
    // Typical sans-serif measurements, used when no host probe is installed.
    *CAP_PROPORTION.get_or_init(|| -74.0f32 / -92.7f32)
}

/// Adjusts `fm` so the line occupies exactly `height` pixels, per the
/// forced line-height rule of [`Span::LineHeight`].
pub fn choose_height(fm: &mut FontMetrics, height: i32) {
    choose_height_with_proportion(fm, height, cap_proportion());
}

fn choose_height_with_proportion(fm: &mut FontMetrics, height: i32, proportion: f32) {
    if height > fm.descent - fm.ascent {
        // Requested height exceeds the natural box; just raise the ascent.
        fm.ascent = -height;
        return;
    }
    // Minimum ascent a capital letter visually requires.
    let need = (-(fm.top as f32) * proportion).ceil() as i32;
    if height - fm.descent >= need {
        // Safe to shrink the ascent alone.
        fm.top = fm.bottom - height;
        fm.ascent = fm.descent - height;
    } else if height >= need {
        // Keep the full cap height, clip the descent.
        fm.top = -need;
        fm.ascent = -need;
        fm.bottom = fm.top + height;
        fm.descent = fm.bottom;
    } else {
        // Show as much of the ascent as fits, and no descent.
        fm.top = -height;
        fm.ascent = -height;
        fm.bottom = 0;
        fm.descent = 0;
    }
}
