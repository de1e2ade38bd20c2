//! Decoding of the `changedFields`, `nulledFields` and `diffFields` bitmaps
//! of a change event into field names.
//!
//! Each bitmap entry is a hex string. `0x<hex>` covers the top-level fields
//! of the event record: bit `i`, counted from the least significant bit of
//! the last hex digit, stands for the field at position `i` in schema
//! order. `<n>-0x<hex>` covers the fields of the compound field at top-level
//! position `n`, and its names render as `Parent.Child`.

use std::collections::HashMap;

use apache_avro::{Schema, schema::RecordSchema};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitmapError {
    #[error("event schema is not a record")]
    SchemaNotRecord,
    #[error("malformed bitmap entry {0:?}")]
    Malformed(String),
    #[error("bit {bit} is beyond the {fields} fields of {record}")]
    BitOutOfRange {
        record: String,
        bit: usize,
        fields: usize,
    },
    #[error("field position {0} does not exist")]
    UnknownParent(usize),
    #[error("field {0} is not a record")]
    ParentNotRecord(String),
}

#[derive(Debug, Clone)]
struct Compound {
    name: String,
    fields: Vec<String>,
}

/// Maps bitmap entries to field names for one event schema.
#[derive(Debug, Clone)]
pub struct BitmapDecoder {
    record: String,
    fields: Vec<String>,
    compounds: HashMap<usize, Compound>,
}

impl BitmapDecoder {
    pub fn new(schema: &Schema) -> Result<Self, BitmapError> {
        let Schema::Record(root) = schema else {
            return Err(BitmapError::SchemaNotRecord);
        };

        let mut names = HashMap::new();
        collect_records(schema, &mut names);

        let compounds = root
            .fields
            .iter()
            .enumerate()
            .filter_map(|(position, field)| {
                let record = record_of(&field.schema, &names)?;
                let compound = Compound {
                    name: field.name.clone(),
                    fields: record.fields.iter().map(|f| f.name.clone()).collect(),
                };
                Some((position, compound))
            })
            .collect();

        Ok(Self {
            record: root.name.fullname(None),
            fields: root.fields.iter().map(|f| f.name.clone()).collect(),
            compounds,
        })
    }

    /// Field names set in `entries`. Top-level entries come first, then
    /// nested ones, each group in input order and bit order within an entry.
    pub fn decode<S: AsRef<str>>(&self, entries: &[S]) -> Result<Vec<String>, BitmapError> {
        let mut top_level = Vec::new();
        let mut nested = Vec::new();

        for entry in entries {
            let entry = entry.as_ref();
            match parse_entry(entry)? {
                (None, bits) => {
                    for bit in bits {
                        top_level.push(self.field(bit)?.to_owned());
                    }
                }
                (Some(parent), bits) => {
                    let compound = self.compound(parent)?;
                    for bit in bits {
                        let child = compound.fields.get(bit).ok_or_else(|| {
                            BitmapError::BitOutOfRange {
                                record: compound.name.clone(),
                                bit,
                                fields: compound.fields.len(),
                            }
                        })?;
                        nested.push(format!("{}.{child}", compound.name));
                    }
                }
            }
        }

        top_level.extend(nested);
        Ok(top_level)
    }

    fn field(&self, bit: usize) -> Result<&str, BitmapError> {
        self.fields
            .get(bit)
            .map(String::as_str)
            .ok_or_else(|| BitmapError::BitOutOfRange {
                record: self.record.clone(),
                bit,
                fields: self.fields.len(),
            })
    }

    fn compound(&self, position: usize) -> Result<&Compound, BitmapError> {
        match self.compounds.get(&position) {
            Some(compound) => Ok(compound),
            None => match self.fields.get(position) {
                Some(name) => Err(BitmapError::ParentNotRecord(name.clone())),
                None => Err(BitmapError::UnknownParent(position)),
            },
        }
    }
}

fn collect_records<'a>(schema: &'a Schema, names: &mut HashMap<String, &'a RecordSchema>) {
    match schema {
        Schema::Record(record) => {
            names.insert(record.name.fullname(None), record);
            for field in &record.fields {
                collect_records(&field.schema, names);
            }
        }
        Schema::Union(union) => {
            for variant in union.variants() {
                collect_records(variant, names);
            }
        }
        _ => {}
    }
}

/// The record behind a field schema, looking through `["null", record]`
/// unions and named references.
fn record_of<'a>(
    schema: &'a Schema,
    names: &HashMap<String, &'a RecordSchema>,
) -> Option<&'a RecordSchema> {
    match schema {
        Schema::Record(record) => Some(record),
        Schema::Ref { name } => names.get(&name.fullname(None)).copied(),
        Schema::Union(union) => union
            .variants()
            .iter()
            .find_map(|variant| record_of(variant, names)),
        _ => None,
    }
}

/// Splits an entry into its optional parent position and the set bits in
/// ascending order.
fn parse_entry(entry: &str) -> Result<(Option<usize>, Vec<usize>), BitmapError> {
    let malformed = || BitmapError::Malformed(entry.to_owned());

    let (parent, bitmap) = match entry.split_once('-') {
        Some((parent, bitmap)) => (Some(parent.parse().map_err(|_| malformed())?), bitmap),
        None => (None, entry),
    };
    let digits = bitmap
        .strip_prefix("0x")
        .or_else(|| bitmap.strip_prefix("0X"))
        .filter(|digits| !digits.is_empty())
        .ok_or_else(malformed)?;

    let mut bits = Vec::new();
    for (nibble, c) in digits.chars().rev().enumerate() {
        let value = c.to_digit(16).ok_or_else(malformed)?;
        for offset in 0..4 {
            if value & (1 << offset) != 0 {
                bits.push(nibble * 4 + offset);
            }
        }
    }
    Ok((parent, bits))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::decode::tests::employee_schema;

    fn decoder() -> BitmapDecoder {
        BitmapDecoder::new(&employee_schema()).unwrap()
    }

    #[rstest]
    #[case("0x1", None, vec![0])]
    #[case("0x06", None, vec![1, 2])]
    #[case("0xA0", None, vec![5, 7])]
    #[case("0x100", None, vec![8])]
    #[case("4-0x05", Some(4), vec![0, 2])]
    #[case("0x0", None, vec![])]
    fn parses_entries(
        #[case] entry: &str,
        #[case] parent: Option<usize>,
        #[case] bits: Vec<usize>,
    ) {
        assert_eq!(parse_entry(entry).unwrap(), (parent, bits));
    }

    #[rstest]
    #[case("")]
    #[case("06")]
    #[case("0x")]
    #[case("0xZZ")]
    #[case("x-0x1")]
    #[case("-0x1")]
    #[case("1-")]
    fn rejects_malformed_entries(#[case] entry: &str) {
        assert_eq!(
            parse_entry(entry),
            Err(BitmapError::Malformed(entry.to_owned()))
        );
    }

    #[test]
    fn decodes_top_level_fields() {
        let names = decoder().decode(&["0x06"]).unwrap();
        assert_eq!(names, ["Name", "LastModifiedDate"]);
    }

    #[test]
    fn decodes_nested_fields() {
        let names = decoder().decode(&["4-0x06", "0x2"]).unwrap();
        assert_eq!(names, ["Name", "Address__c.City", "Address__c.PostalCode"]);
    }

    #[test]
    fn empty_input_decodes_to_nothing() {
        let entries: [&str; 0] = [];
        assert!(decoder().decode(&entries).unwrap().is_empty());
    }

    #[test]
    fn bits_beyond_the_schema_are_rejected() {
        assert!(matches!(
            decoder().decode(&["0x40"]),
            Err(BitmapError::BitOutOfRange { bit: 6, fields: 6, .. })
        ));
        assert!(matches!(
            decoder().decode(&["4-0x8"]),
            Err(BitmapError::BitOutOfRange { bit: 3, fields: 3, .. })
        ));
    }

    #[test]
    fn parent_must_be_a_record() {
        assert_eq!(
            decoder().decode(&["1-0x1"]),
            Err(BitmapError::ParentNotRecord("Name".into()))
        );
        assert_eq!(
            decoder().decode(&["9-0x1"]),
            Err(BitmapError::UnknownParent(9))
        );
    }

    #[test]
    fn resolves_named_references() {
        let schema = Schema::parse_str(
            r#"{
                "type": "record",
                "name": "Account__ChangeEvent",
                "namespace": "com.sforce.eventbus",
                "fields": [
                    {"name": "BillingAddress", "type": ["null", {
                        "type": "record",
                        "name": "Address",
                        "fields": [
                            {"name": "Street", "type": ["null", "string"]},
                            {"name": "City", "type": ["null", "string"]}
                        ]
                    }]},
                    {"name": "ShippingAddress", "type": ["null", "Address"]}
                ]
            }"#,
        )
        .unwrap();
        let decoder = BitmapDecoder::new(&schema).unwrap();

        let names = decoder.decode(&["1-0x3"]).unwrap();
        assert_eq!(names, ["ShippingAddress.Street", "ShippingAddress.City"]);
    }

    #[test]
    fn schema_must_be_a_record() {
        assert_eq!(
            BitmapDecoder::new(&Schema::String).unwrap_err(),
            BitmapError::SchemaNotRecord
        );
    }
}
