use crate::chunk::{ChunkError, ChunkPool, ChunkResult, PoolWriter};
use crate::string_pool::{
    ColorResolver, PoolSource, RichText, Span, SpanRun, StringPool, StyleRun, SystemColor,
};
use crate::XmlError;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool source that counts how often the underlying bytes are decoded.
struct CountingSource {
    strings: Vec<String>,
    styles: Vec<Vec<StyleRun>>,
    string_calls: AtomicUsize,
}

impl CountingSource {
    fn new(strings: &[&str]) -> CountingSource {
        CountingSource {
            strings: strings.iter().map(|s| s.to_string()).collect(),
            styles: vec![Vec::new(); strings.len()],
            string_calls: AtomicUsize::new(0),
        }
    }

    fn style(mut self, index: usize, runs: Vec<StyleRun>) -> CountingSource {
        self.styles[index] = runs;
        self
    }

    fn calls(&self) -> usize {
        self.string_calls.load(Ordering::SeqCst)
    }
}

impl PoolSource for CountingSource {
    fn len(&self) -> usize {
        self.strings.len()
    }

    fn string_at(&self, index: usize) -> ChunkResult<String> {
        self.string_calls.fetch_add(1, Ordering::SeqCst);
        self.strings
            .get(index)
            .cloned()
            .ok_or_else(|| ChunkError::Malformed(format!("string index {index} out of range")))
    }

    fn style_runs_at(&self, index: usize) -> ChunkResult<Vec<StyleRun>> {
        Ok(self.styles.get(index).cloned().unwrap_or_default())
    }
}

struct FixedResolver;

impl ColorResolver for FixedResolver {
    fn resolve(&self, name: &str) -> Option<SystemColor> {
        (name == "holo_blue_light").then_some(SystemColor {
            resource_id: 0x0106_0033,
            argb: 0xFF33_B5E5,
        })
    }
}

fn run(tag: u32, first: u32, last: u32) -> StyleRun {
    StyleRun { tag, first, last }
}

#[test]
fn repeated_get_decodes_once() {
    let source = Arc::new(CountingSource::new(&["alpha", "beta"]));
    let pool = StringPool::new(Arc::clone(&source) as Arc<dyn PoolSource>);

    let first = pool.get(0).unwrap();
    let second = pool.get(0).unwrap();
    let third = pool.get(0).unwrap();

    assert_eq!(first.text(), "alpha");
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(source.calls(), 1);

    pool.get(1).unwrap();
    assert_eq!(source.calls(), 2);
}

#[test]
fn every_index_reachable_in_large_and_small_pools() {
    // One pool on each side of the sparse-storage threshold.
    for size in [10usize, 300] {
        let strings: Vec<String> = (0..size).map(|i| format!("entry {i}")).collect();
        let refs: Vec<&str> = strings.iter().map(String::as_str).collect();
        let pool = StringPool::new(Arc::new(CountingSource::new(&refs)));
        for i in (0..size).rev() {
            assert_eq!(pool.get(i).unwrap().text(), format!("entry {i}"));
        }
    }
}

#[test]
fn dense_only_pool_still_serves_large_tables() {
    let strings: Vec<String> = (0..260).map(|i| format!("s{i}")).collect();
    let refs: Vec<&str> = strings.iter().map(String::as_str).collect();
    let source = Arc::new(CountingSource::new(&refs));
    let pool = StringPool::new(Arc::clone(&source) as Arc<dyn PoolSource>).dense_only();
    pool.get(259).unwrap();
    pool.get(259).unwrap();
    assert_eq!(source.calls(), 1);
}

#[test]
fn simple_tag_becomes_span() {
    let source = CountingSource::new(&["hello world", "b"]).style(0, vec![run(1, 0, 4)]);
    let pool = StringPool::new(Arc::new(source));

    let value = pool.get(0).unwrap();
    assert_eq!(value.text(), "hello world");
    assert_eq!(
        value.spans(),
        &[SpanRun {
            span: Span::Bold,
            start: 0,
            end: 5,
        }]
    );
}

#[test]
fn unstyled_entry_stays_plain() {
    let pool = StringPool::new(Arc::new(CountingSource::new(&["plain"])));
    assert!(matches!(pool.get(0).unwrap(), RichText::Plain(_)));
}

#[test]
fn bullet_span_repaired_to_paragraph_bounds() {
    // The run covers a single character of the middle paragraph; the
    // produced span must cover the whole paragraph.
    let source = CountingSource::new(&["ab\ncd\nef", "li"]).style(0, vec![run(1, 3, 3)]);
    let pool = StringPool::new(Arc::new(source));

    let value = pool.get(0).unwrap();
    assert_eq!(
        value.spans(),
        &[SpanRun {
            span: Span::Bullet,
            start: 3,
            end: 5,
        }]
    );
}

#[test]
fn font_tag_expands_to_component_spans() {
    let source = CountingSource::new(&["sized text", "font;height=30;size=12;face=serif"])
        .style(0, vec![run(1, 0, 9)]);
    let pool = StringPool::new(Arc::new(source));

    let spans = pool.get(0).unwrap().spans().to_vec();
    assert!(spans.contains(&SpanRun {
        span: Span::LineHeight(30),
        start: 0,
        end: 10,
    }));
    assert!(spans.contains(&SpanRun {
        span: Span::AbsoluteSize(12),
        start: 0,
        end: 10,
    }));
    assert!(spans.contains(&SpanRun {
        span: Span::Typeface("serif".to_string()),
        start: 0,
        end: 10,
    }));
}

#[test]
fn font_colors_resolve_through_the_system_resolver() {
    let source = CountingSource::new(&[
        "colored",
        "font;color=@holo_blue_light;bgcolor=@holo_blue_light",
    ])
    .style(0, vec![run(1, 0, 6)]);
    let pool = StringPool::new(Arc::new(source)).resolver(Arc::new(FixedResolver));

    let spans = pool.get(0).unwrap().spans().to_vec();
    // A foreground resource becomes a text-appearance span; a background
    // resource is flattened to its ARGB value.
    assert!(spans.iter().any(|s| s.span == Span::TextAppearance(0x0106_0033)));
    assert!(spans.iter().any(|s| s.span == Span::BackgroundColor(0xFF33_B5E5)));
}

#[test]
fn unresolvable_color_reference_is_skipped() {
    let source =
        CountingSource::new(&["colored", "font;color=@no_such_color"]).style(0, vec![run(1, 0, 6)]);
    let pool = StringPool::new(Arc::new(source));
    assert!(pool.get(0).unwrap().spans().is_empty());
}

#[test]
fn invalid_color_literal_falls_back_to_black() {
    let source =
        CountingSource::new(&["colored", "font;color=#zzz"]).style(0, vec![run(1, 0, 6)]);
    let pool = StringPool::new(Arc::new(source));
    let spans = pool.get(0).unwrap().spans().to_vec();
    assert!(spans.iter().any(|s| s.span == Span::ForegroundColor(0xFF00_0000)));
}

#[test]
fn anchor_and_annotation_tags() {
    let source = CountingSource::new(&[
        "click here",
        "a;href=https://example.com",
        "annotation;kind=emphasis",
    ])
    .style(0, vec![run(1, 0, 9), run(2, 6, 9)]);
    let pool = StringPool::new(Arc::new(source));

    let spans = pool.get(0).unwrap().spans().to_vec();
    assert!(spans.contains(&SpanRun {
        span: Span::Link("https://example.com".to_string()),
        start: 0,
        end: 10,
    }));
    assert!(spans.contains(&SpanRun {
        span: Span::Annotation {
            key: "kind".to_string(),
            value: "emphasis".to_string(),
        },
        start: 6,
        end: 10,
    }));
}

#[test]
fn unknown_tag_produces_no_span() {
    let source = CountingSource::new(&["text", "blink"]).style(0, vec![run(1, 0, 3)]);
    let pool = StringPool::new(Arc::new(source));
    assert!(pool.get(0).unwrap().spans().is_empty());
}

#[test]
fn out_of_range_run_is_clamped() {
    let source = CountingSource::new(&["ab", "b"]).style(0, vec![run(1, 1, 40)]);
    let pool = StringPool::new(Arc::new(source));
    assert_eq!(
        pool.get(0).unwrap().spans(),
        &[SpanRun {
            span: Span::Bold,
            start: 1,
            end: 2,
        }]
    );
}

#[test]
fn closed_pool_rejects_lookups() {
    let pool = StringPool::new(Arc::new(CountingSource::new(&["gone"])));
    pool.get(0).unwrap();
    pool.close();
    pool.close();
    assert!(pool.is_closed());
    assert!(matches!(pool.get(0), Err(XmlError::PoolClosed)));
}

#[test]
fn chunk_pool_round_trip_under_random_load() {
    let mut rng = thread_rng();
    let strings: Vec<String> = (0..400)
        .map(|_| {
            let len = rng.gen_range(0..64);
            (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect()
        })
        .collect();

    let mut writer = PoolWriter::new();
    for s in &strings {
        writer.intern(s);
    }
    let decoded = ChunkPool::from_chunk(&writer.to_chunk()).unwrap();
    let pool = StringPool::new(Arc::new(decoded));

    // Random access order, every entry visited at least once.
    let mut order: Vec<usize> = (0..strings.len()).collect();
    for i in (1..order.len()).rev() {
        order.swap(i, rng.gen_range(0..=i));
    }
    for index in order {
        let expected = writer.index_of(&strings[index]).unwrap() as usize;
        assert_eq!(pool.get(expected).unwrap().text(), strings[index]);
    }
}
