//! Record layout descriptors.

use indexmap::IndexMap;
use tether_core::{InteropError, Result};

use crate::prim::Prim;
use crate::record::RawRecord;

/// One field of a native record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    /// Field name as spelled in the native header.
    pub name: &'static str,
    /// Byte offset from the start of the record.
    pub offset: usize,
    /// Primitive type of one element.
    pub prim: Prim,
    /// Element count; 1 for scalar fields, N for `T name[N]`.
    pub count: usize,
}

impl Field {
    /// Total bytes occupied by the field.
    pub fn byte_len(&self) -> usize {
        self.prim.size() * self.count
    }

    /// Offset of element `i` of an array field. Unchecked.
    pub fn element_offset(&self, i: usize) -> usize {
        self.offset + i * self.prim.size()
    }
}

/// How the byte size of a record is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeRule {
    /// The record always occupies this many bytes.
    Fixed(usize),
    /// A fixed header followed by a variable trailing array whose length
    /// is held in an `int` field of the header.
    Trailing {
        /// Offset of the first trailing element (the padded header size).
        base: usize,
        /// Name of the `int` field holding the trailing element count.
        count_field: &'static str,
        /// Size of one trailing element in bytes.
        elem: usize,
    },
}

/// Field order, offsets and size contract of one native record type.
#[derive(Clone, Debug)]
pub struct RecordLayout {
    name: &'static str,
    fields: IndexMap<&'static str, Field>,
    header_size: usize,
    align: usize,
    end: usize,
    rule: SizeRule,
}

impl RecordLayout {
    /// Record type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Result<&Field> {
        self.fields
            .get(name)
            .ok_or_else(|| InteropError::UnknownField {
                record: self.name,
                field: name.to_owned(),
            })
    }

    /// Byte offset of a field.
    pub fn offset_of(&self, name: &str) -> Result<usize> {
        self.field(name).map(|f| f.offset)
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.fields.values()
    }

    /// Size of the fixed part, padded to the record alignment. This is
    /// what `sizeof` reports for the native type.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Alignment of the record.
    pub fn align(&self) -> usize {
        self.align
    }

    /// The size rule.
    pub fn size_rule(&self) -> SizeRule {
        self.rule
    }

    /// Byte size of a record.
    ///
    /// This is the one size contract every allocation, pointer walk and
    /// pressure amount goes through. Fixed records ignore `live`; records
    /// with a trailing array read their count field from `live` and fail
    /// with [`InteropError::UnknownLength`] without it.
    pub fn record_size(&self, live: Option<&RawRecord<'_>>) -> Result<usize> {
        match self.rule {
            SizeRule::Fixed(size) => Ok(size),
            SizeRule::Trailing { count_field, .. } => {
                let record = live.ok_or(InteropError::UnknownLength)?;
                let count: i32 = record.read(count_field)?;
                let count = usize::try_from(count).map_err(|_| InteropError::LayoutMismatch {
                    record: self.name,
                    expected: 0,
                    actual: count.unsigned_abs() as usize,
                })?;
                Ok(self.size_for_count(count))
            }
        }
    }

    /// Byte size for a given trailing element count, before the record
    /// exists. Fixed records return their fixed size.
    pub fn size_for_count(&self, count: usize) -> usize {
        match self.rule {
            SizeRule::Fixed(size) => size,
            SizeRule::Trailing { base, elem, .. } => base + count * elem,
        }
    }

    /// Offset of the first trailing element, if the record has any.
    pub fn trailing_offset(&self) -> Option<usize> {
        match self.rule {
            SizeRule::Fixed(_) => None,
            SizeRule::Trailing { base, .. } => Some(base),
        }
    }
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Lays fields out the way the host C compiler does.
///
/// Each field starts at the next offset aligned to its primitive; the
/// record is padded to its widest alignment.
///
/// ```
/// use tether_layout::{LayoutBuilder, Prim};
///
/// let point = LayoutBuilder::new("Point")
///     .field("x", Prim::I32)
///     .field("next", Prim::Ptr)
///     .build();
/// assert_eq!(point.offset_of("next").unwrap(), std::mem::size_of::<usize>());
/// ```
#[derive(Clone, Debug)]
pub struct LayoutBuilder {
    name: &'static str,
    fields: IndexMap<&'static str, Field>,
    cursor: usize,
    align: usize,
    trailing: Option<(&'static str, Prim)>,
}

impl LayoutBuilder {
    /// Start an empty record.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: IndexMap::new(),
            cursor: 0,
            align: 1,
            trailing: None,
        }
    }

    /// Start from every field of `parent`, the way C records that embed a
    /// header macro share their prefix with the parent type.
    pub fn extend(name: &'static str, parent: &RecordLayout) -> Self {
        Self {
            name,
            fields: parent.fields.clone(),
            cursor: parent.end,
            align: parent.align,
            trailing: None,
        }
    }

    /// Append a scalar field.
    ///
    /// # Panics
    ///
    /// If `name` is already defined.
    pub fn field(self, name: &'static str, prim: Prim) -> Self {
        self.array(name, prim, 1)
    }

    /// Append a fixed-length array field `prim name[count]`.
    ///
    /// # Panics
    ///
    /// If `name` is already defined or `count` is zero.
    pub fn array(mut self, name: &'static str, prim: Prim, count: usize) -> Self {
        assert!(count > 0, "{}.{name}: zero-length array", self.name);
        let offset = align_up(self.cursor, prim.align());
        let field = Field {
            name,
            offset,
            prim,
            count,
        };
        let previous = self.fields.insert(name, field);
        assert!(previous.is_none(), "{}.{name} defined twice", self.name);
        self.cursor = offset + field.byte_len();
        self.align = self.align.max(prim.align());
        self
    }

    /// Declare a trailing array of `elem` whose length lives in the `int`
    /// field `count_field`.
    pub fn trailing(mut self, count_field: &'static str, elem: Prim) -> Self {
        self.trailing = Some((count_field, elem));
        self
    }

    /// Finish the layout.
    pub fn build(self) -> RecordLayout {
        let header_size = align_up(self.cursor, self.align);
        let rule = match self.trailing {
            None => SizeRule::Fixed(header_size),
            Some((count_field, elem)) => {
                debug_assert!(
                    self.fields
                        .get(count_field)
                        .is_some_and(|f| f.prim == Prim::I32),
                    "{}: trailing count field must be an int",
                    self.name
                );
                SizeRule::Trailing {
                    base: align_up(header_size, elem.align()),
                    count_field,
                    elem: elem.size(),
                }
            }
        };
        log::trace!("layout {}: {header_size} bytes, {:?}", self.name, rule);
        RecordLayout {
            name: self.name,
            fields: self.fields,
            header_size,
            align: self.align,
            end: self.cursor,
            rule,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed() -> RecordLayout {
        LayoutBuilder::new("Mixed")
            .field("a", Prim::I32)
            .field("b", Prim::F64)
            .field("c", Prim::F32)
            .build()
    }

    #[test]
    fn fields_are_naturally_aligned() {
        let l = mixed();
        assert_eq!(l.offset_of("a").unwrap(), 0);
        assert_eq!(l.offset_of("b").unwrap(), 8);
        assert_eq!(l.offset_of("c").unwrap(), 16);
        assert_eq!(l.header_size(), 24);
        assert_eq!(l.record_size(None).unwrap(), 24);
    }

    #[test]
    fn declaration_order_is_preserved() {
        let names: Vec<_> = mixed().fields().map(|f| f.name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn unknown_field_is_reported() {
        let err = mixed().offset_of("zz").unwrap_err();
        assert_eq!(
            err,
            InteropError::UnknownField {
                record: "Mixed",
                field: "zz".into()
            }
        );
    }

    #[test]
    fn array_fields_take_count_elements() {
        let l = LayoutBuilder::new("Arr")
            .array("v", Prim::I32, 3)
            .field("w", Prim::I32)
            .build();
        let v = l.field("v").unwrap();
        assert_eq!(v.byte_len(), 12);
        assert_eq!(v.element_offset(2), 8);
        assert_eq!(l.offset_of("w").unwrap(), 12);
    }

    #[test]
    fn extension_continues_after_the_parent_fields() {
        let parent = LayoutBuilder::new("P")
            .field("flags", Prim::I32)
            .field("next", Prim::Ptr)
            .field("tail", Prim::I32)
            .build();
        let child = LayoutBuilder::extend("C", &parent)
            .field("extra", Prim::I32)
            .build();
        // `extra` packs into the parent's tail padding, as in C macros.
        assert_eq!(child.offset_of("extra").unwrap(), parent.offset_of("tail").unwrap() + 4);
        assert_eq!(child.fields().count(), 4);
    }

    #[test]
    fn trailing_size_needs_a_count() {
        let l = LayoutBuilder::new("T")
            .field("n", Prim::I32)
            .trailing("n", Prim::F64)
            .build();
        assert_eq!(l.trailing_offset(), Some(8));
        assert_eq!(l.size_for_count(3), 8 + 24);
        assert_eq!(l.record_size(None), Err(InteropError::UnknownLength));
    }

    #[test]
    #[should_panic(expected = "defined twice")]
    fn duplicate_field_panics() {
        let _ = LayoutBuilder::new("D")
            .field("x", Prim::I32)
            .field("x", Prim::I32);
    }

    #[cfg(not(miri))]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const NAMES: [&str; 12] = [
            "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11",
        ];

        fn prim() -> impl Strategy<Value = Prim> {
            prop_oneof![
                Just(Prim::I32),
                Just(Prim::U32),
                Just(Prim::F32),
                Just(Prim::F64),
                Just(Prim::I64),
                Just(Prim::Ptr),
            ]
        }

        proptest! {
            #[test]
            fn offsets_are_aligned_and_never_overlap(
                spec in prop::collection::vec((prim(), 1usize..4), 1..12),
            ) {
                let layout = spec
                    .iter()
                    .zip(NAMES)
                    .fold(LayoutBuilder::new("Gen"), |b, (&(prim, count), name)| {
                        b.array(name, prim, count)
                    })
                    .build();

                let mut end = 0;
                for field in layout.fields() {
                    prop_assert_eq!(field.offset % field.prim.align(), 0);
                    prop_assert!(field.offset >= end);
                    end = field.offset + field.byte_len();
                }
                let widest = spec.iter().map(|(p, _)| p.align()).max().unwrap_or(1);
                prop_assert_eq!(layout.align(), widest);
                prop_assert!(layout.header_size() >= end);
                prop_assert_eq!(layout.header_size() % layout.align(), 0);
                prop_assert!(layout.header_size() < end + layout.align());
            }
        }
    }
}
