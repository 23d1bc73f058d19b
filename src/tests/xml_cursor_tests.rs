use crate::chunk::{
    data_type, Attribute, AttributeEntry, ChunkResult, Element, StartElement, Token, TypedValue,
    XmlTree, NO_ENTRY,
};
use crate::string_pool::{PoolSource, StringPool, StyleRun};
use crate::xml_cursor::{
    XmlBlock, XmlEvent, FEATURE_PROCESS_NAMESPACES, FEATURE_REPORT_NAMESPACE_ATTRIBUTES,
};
use crate::XmlError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

fn block_for(root: &Element) -> XmlBlock {
    let namespaces = [("android".to_string(), ANDROID_NS.to_string())];
    let bytes = root.encode_document(&namespaces).unwrap();
    XmlBlock::from_bytes(&bytes).unwrap()
}

#[test]
fn event_stream_and_deferred_depth() {
    let root = Element::new("a").child(Element::new("b"));
    let block = block_for(&root);
    let mut cursor = block.cursor();

    assert_eq!(cursor.event_type(), XmlEvent::StartDocument);
    assert_eq!(cursor.next().unwrap(), XmlEvent::StartDocument);
    assert_eq!(cursor.depth(), 0);

    assert_eq!(cursor.next().unwrap(), XmlEvent::StartTag);
    assert_eq!(cursor.name().unwrap().as_deref(), Some("a"));
    assert_eq!(cursor.depth(), 1);

    assert_eq!(cursor.next().unwrap(), XmlEvent::StartTag);
    assert_eq!(cursor.depth(), 2);

    // The depth of an element is still reported at its END_TAG; the
    // decrement lands on the following advance.
    assert_eq!(cursor.next().unwrap(), XmlEvent::EndTag);
    assert_eq!(cursor.name().unwrap().as_deref(), Some("b"));
    assert_eq!(cursor.depth(), 2);

    assert_eq!(cursor.next().unwrap(), XmlEvent::EndTag);
    assert_eq!(cursor.depth(), 1);

    assert_eq!(cursor.next().unwrap(), XmlEvent::EndDocument);
    // Idempotent once the document is exhausted.
    assert_eq!(cursor.next().unwrap(), XmlEvent::EndDocument);
}

#[test]
fn typed_attribute_access() {
    let root = Element::new("widget")
        .attr(Attribute::new("count", 42))
        .attr(Attribute::new("enabled", true))
        .attr(Attribute::new("ratio", 2.5f32))
        .attr(Attribute::new("title", "hello"))
        .attr(Attribute::new("empty", TypedValue::Null))
        .attr(Attribute::new("flags", TypedValue::Hex(0x7f)))
        .attr(Attribute::new("target", TypedValue::Reference(0x7f01_00ff)));
    let block = block_for(&root);
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap();

    assert_eq!(cursor.attribute_count(), 7);
    assert_eq!(cursor.attribute_value(0).unwrap(), "42");
    assert_eq!(cursor.attribute_value(1).unwrap(), "true");
    assert_eq!(cursor.attribute_value(3).unwrap(), "hello");
    assert_eq!(cursor.attribute_value(5).unwrap(), "0x7f");
    assert_eq!(
        cursor.attribute_value(6).unwrap(),
        format!("@{}", 0x7f01_00ffu32)
    );

    // A TYPE_NULL value has no string form at all.
    assert!(matches!(
        cursor.attribute_value(4),
        Err(XmlError::IndexOutOfRange(4))
    ));

    assert_eq!(cursor.attribute_int_by_name(None, "count", 0).unwrap(), 42);
    assert!(cursor.attribute_bool_by_name(None, "enabled", false).unwrap());
    assert_eq!(
        cursor.attribute_unsigned_int_by_name(None, "flags", 0).unwrap(),
        0x7f
    );
    assert_eq!(
        cursor
            .attribute_resource_by_name(None, "target", 0)
            .unwrap(),
        0x7f01_00ff
    );

    // Mismatched types fall back to the caller's default.
    assert_eq!(cursor.attribute_int_by_name(None, "title", -7).unwrap(), -7);
    assert!(!cursor.attribute_bool_by_name(None, "title", false).unwrap());

    // Absent names fall back too, never error.
    assert_eq!(cursor.attribute_index(None, "missing").unwrap(), None);
    assert_eq!(cursor.attribute_int_by_name(None, "missing", 9).unwrap(), 9);
}

#[test]
fn float_accessors_disagree_on_mismatch() {
    let root = Element::new("widget")
        .attr(Attribute::new("ratio", 2.5f32))
        .attr(Attribute::new("count", 42));
    let block = block_for(&root);
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap();

    assert_eq!(cursor.attribute_float(0).unwrap(), 2.5);
    // By index a non-float is an error; by name it yields the default.
    assert!(cursor.attribute_float(1).is_err());
    assert_eq!(
        cursor.attribute_float_by_name(None, "count", 1.5).unwrap(),
        1.5
    );
    assert_eq!(
        cursor.attribute_float_by_name(None, "ratio", 1.5).unwrap(),
        2.5
    );
}

#[test]
fn namespaced_attribute_and_name_resource() {
    let root = Element::new("view").attr(
        Attribute::with_namespace(ANDROID_NS, "scale", 3).resource_id(0x0101_0000),
    );
    let block = block_for(&root);
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap();

    assert_eq!(cursor.attribute_namespace(0).unwrap(), ANDROID_NS);
    assert_eq!(cursor.attribute_name(0).unwrap(), "scale");
    assert_eq!(cursor.attribute_name_resource(0).unwrap(), 0x0101_0000);
    assert_eq!(
        cursor.attribute_index(Some(ANDROID_NS), "scale").unwrap(),
        Some(0)
    );
    // The unqualified name does not match a namespaced attribute.
    assert_eq!(cursor.attribute_index(None, "scale").unwrap(), None);
    assert_eq!(
        cursor
            .attribute_int_by_name(Some(ANDROID_NS), "scale", 0)
            .unwrap(),
        3
    );
}

#[test]
fn next_text_reads_element_content() {
    let root = Element::new("outer")
        .child(Element::new("msg").text("hello"))
        .child(Element::new("hollow"));
    let block = block_for(&root);
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap(); // <outer>

    assert_eq!(cursor.next_tag().unwrap(), XmlEvent::StartTag);
    assert_eq!(cursor.name().unwrap().as_deref(), Some("msg"));
    assert_eq!(cursor.next_text().unwrap(), "hello");

    assert_eq!(cursor.next_tag().unwrap(), XmlEvent::StartTag);
    assert_eq!(cursor.next_text().unwrap(), "");
}

#[test]
fn next_tag_skips_whitespace_text() {
    let root = Element::new("outer")
        .text("  \n  ")
        .child(Element::new("inner"));
    let block = block_for(&root);
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap();

    assert_eq!(cursor.next_tag().unwrap(), XmlEvent::StartTag);
    assert_eq!(cursor.name().unwrap().as_deref(), Some("inner"));
}

#[test]
fn require_checks_event_and_name() {
    let root = Element::new("outer");
    let block = block_for(&root);
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap();

    cursor
        .require(XmlEvent::StartTag, None, Some("outer"))
        .unwrap();
    assert!(cursor
        .require(XmlEvent::StartTag, None, Some("inner"))
        .is_err());
    assert!(cursor.require(XmlEvent::EndTag, None, None).is_err());
}

#[test]
fn line_numbers_and_position() {
    let root = Element::new("outer").line(42);
    let block = block_for(&root);
    let mut cursor = block.cursor();

    assert_eq!(cursor.line_number(), -1);
    cursor.next().unwrap();
    cursor.next().unwrap();
    assert_eq!(cursor.line_number(), 42);
    assert_eq!(cursor.position_description(), "Binary XML file line #42");
    assert_eq!(cursor.column_number(), -1);
}

#[test]
fn namespace_features_are_fixed_on() {
    let root = Element::new("outer");
    let block = block_for(&root);
    let mut cursor = block.cursor();

    assert!(cursor.feature(FEATURE_PROCESS_NAMESPACES));
    assert!(cursor.feature(FEATURE_REPORT_NAMESPACE_ATTRIBUTES));
    assert!(!cursor.feature("http://xmlpull.org/v1/doc/features.html#validation"));

    cursor.set_feature(FEATURE_PROCESS_NAMESPACES, true).unwrap();
    assert!(cursor.set_feature(FEATURE_PROCESS_NAMESPACES, false).is_err());
    assert!(cursor.set_feature("unknown", true).is_err());
}

#[test]
fn pre_parsed_operations_are_rejected() {
    let root = Element::new("outer");
    let block = block_for(&root);
    let mut cursor = block.cursor();

    assert!(matches!(
        cursor.set_input("<xml/>"),
        Err(XmlError::Unsupported(_))
    ));
    assert!(matches!(
        cursor.define_entity_replacement_text("amp", "&"),
        Err(XmlError::Unsupported(_))
    ));
    assert!(matches!(cursor.set_property("p"), Err(XmlError::Unsupported(_))));
    assert!(matches!(cursor.namespace_prefix(0), Err(XmlError::Unsupported(_))));
    assert!(matches!(cursor.namespace_uri(0), Err(XmlError::Unsupported(_))));
    assert!(matches!(cursor.namespace_count(1), Err(XmlError::Unsupported(_))));
}

#[test]
fn block_release_waits_for_last_cursor() {
    let root = Element::new("outer");
    let bytes = root.encode_document(&[]).unwrap();
    let mut block = XmlBlock::from_bytes(&bytes).unwrap();

    let released = Arc::new(AtomicUsize::new(0));
    let observer = Arc::clone(&released);
    block.on_release(Box::new(move || {
        observer.fetch_add(1, Ordering::SeqCst);
    }));

    let mut cursor = block.cursor();
    block.close();
    block.close();
    assert_eq!(released.load(Ordering::SeqCst), 0);

    // The surviving cursor still reads the shared tree.
    cursor.next().unwrap();
    assert_eq!(cursor.next().unwrap(), XmlEvent::StartTag);
    assert_eq!(cursor.name().unwrap().as_deref(), Some("outer"));

    // Running off the end closes the cursor and releases the block.
    cursor.next().unwrap();
    assert_eq!(cursor.next().unwrap(), XmlEvent::EndDocument);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    cursor.close();
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn closing_the_block_alone_closes_the_pool() {
    let bytes = Element::new("outer").encode_document(&[]).unwrap();
    let mut block = XmlBlock::from_bytes(&bytes).unwrap();
    assert!(!block.pool().is_closed());
    block.close();
    assert!(block.pool().is_closed());
}

// Hand-built tree with the id/class/style indices the writer does not
// emit, mirroring what the compiler produces for those attributes.
struct FixedSource(Vec<&'static str>);

impl PoolSource for FixedSource {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn string_at(&self, index: usize) -> ChunkResult<String> {
        Ok(self.0[index].to_string())
    }

    fn style_runs_at(&self, _index: usize) -> ChunkResult<Vec<StyleRun>> {
        Ok(Vec::new())
    }
}

#[test]
fn id_class_and_style_shortcuts() {
    // Pool: 0 tag, 1 "id", 2 "class", 3 class value, 4 "style".
    let source = FixedSource(vec!["view", "id", "class", "custom.View", "style"]);
    let attributes = vec![
        AttributeEntry {
            ns: NO_ENTRY,
            name: 1,
            raw: NO_ENTRY,
            data_type: data_type::REFERENCE,
            data: 0x7f01_0001,
        },
        AttributeEntry {
            ns: NO_ENTRY,
            name: 2,
            raw: 3,
            data_type: data_type::STRING,
            data: 3,
        },
        AttributeEntry {
            ns: NO_ENTRY,
            name: 4,
            raw: NO_ENTRY,
            data_type: data_type::REFERENCE,
            data: 0x7f02_0002,
        },
    ];
    let tree = XmlTree {
        tokens: vec![
            Token::StartElement(Box::new(StartElement {
                line: 1,
                ns: NO_ENTRY,
                name: 0,
                id_index: 1,
                class_index: 2,
                style_index: 3,
                attributes,
            })),
            Token::EndElement {
                line: 1,
                ns: NO_ENTRY,
                name: 0,
            },
        ],
        resource_map: Vec::new(),
    };
    let block = XmlBlock::new(tree, StringPool::new(Arc::new(source)));
    let mut cursor = block.cursor();
    cursor.next().unwrap();
    cursor.next().unwrap();

    assert_eq!(
        cursor.id_attribute().unwrap(),
        Some(format!("@{}", 0x7f01_0001u32))
    );
    assert_eq!(
        cursor.class_attribute().unwrap(),
        Some("custom.View".to_string())
    );
    assert_eq!(cursor.style_attribute_resource().unwrap(), 0x7f02_0002);
}
