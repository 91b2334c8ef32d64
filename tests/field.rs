use anyhow::Result;
use irontile::field::{FieldEnum, ScalarType, TaggedValue};
use irontile::testing::source;
use irontile::{
    FieldType, FieldValue, Fields, GraphBuilder, GraphError, OpKind, Operator, Partitioner,
    ShuffleFetchType,
};
use std::collections::BTreeMap;

fn reduction_fields() -> Fields {
    Fields::new("Reduction", OpKind::Reduction.schema())
}

#[test]
fn unset_fields_read_declared_defaults() -> Result<()> {
    let f = reduction_fields();

    assert_eq!(f.get_string("func")?, None);
    assert!(f.get_bool("skipna")?);
    assert!(f.get_strings("by")?.is_empty());
    assert!(!f.is_set("skipna"));
    Ok(())
}

#[test]
fn set_fields_read_back() -> Result<()> {
    let mut f = reduction_fields();
    f.set("func", "sum")?;
    f.set("skipna", false)?;
    f.set("by", vec!["a", "b"])?;

    assert_eq!(f.get_string("func")?.as_deref(), Some("sum"));
    assert!(!f.get_bool("skipna")?);
    assert_eq!(f.get_strings("by")?, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(f.explicit().count(), 3);
    Ok(())
}

#[test]
fn wrong_type_is_rejected() {
    let mut f = reduction_fields();

    assert!(matches!(
        f.set("skipna", 1i32),
        Err(GraphError::FieldType { field: "skipna", .. })
    ));
    assert!(matches!(
        f.set("by", vec![1i64, 2]),
        Err(GraphError::FieldType { field: "by", .. })
    ));
    assert!(!f.is_set("skipna"));
}

#[test]
fn null_only_accepted_where_default_is_null() -> Result<()> {
    let mut f = reduction_fields();
    f.set("func", FieldValue::Null)?;

    assert!(matches!(
        f.set("skipna", FieldValue::Null),
        Err(GraphError::FieldType { .. })
    ));
    Ok(())
}

#[test]
fn unknown_field_is_rejected() {
    let mut f = reduction_fields();

    let err = f.set("axis", 0i32).err();
    assert!(matches!(
        err,
        Some(GraphError::UnknownField { kind: "Reduction", ref field }) if field == "axis"
    ));
    assert!(f.get("axis").is_err());
}

#[test]
fn reference_fields_accept_only_declared_variants() -> Result<()> {
    let mut f = Fields::new("FetchShuffle", OpKind::FetchShuffle.schema());

    assert_eq!(
        f.get_enum::<ShuffleFetchType>("shuffle_fetch_type")?,
        ShuffleFetchType::FetchByKey
    );
    f.set("shuffle_fetch_type", ShuffleFetchType::FetchByIndex.to_field())?;
    assert_eq!(
        f.get_enum::<ShuffleFetchType>("shuffle_fetch_type")?,
        ShuffleFetchType::FetchByIndex
    );
    assert!(
        f.set(
            "shuffle_fetch_type",
            FieldValue::Reference("FETCH_BY_NAME".into())
        )
        .is_err()
    );
    assert!(f.set("shuffle_fetch_type", "FETCH_BY_KEY").is_err());
    Ok(())
}

#[test]
fn enum_variants_round_trip() {
    for v in [ShuffleFetchType::FetchByKey, ShuffleFetchType::FetchByIndex] {
        assert_eq!(ShuffleFetchType::from_variant(v.variant()), Some(v));
    }
    for p in [Partitioner::Hash, Partitioner::Range] {
        assert_eq!(Partitioner::from_variant(p.variant()), Some(p));
    }
    assert_eq!(Partitioner::from_variant("ROUND_ROBIN"), None);
}

#[test]
fn type_tags() {
    assert_eq!(FieldType::INT64.tag(), "int64");
    assert_eq!(FieldType::List(ScalarType::String).tag(), "list<string>");
    let fetch_type = OpKind::FetchShuffle
        .schema()
        .iter()
        .find(|d| d.name == "shuffle_fetch_type")
        .map(|d| d.ty.tag());
    assert_eq!(fetch_type.as_deref(), Some("ref<ShuffleFetchType>"));
}

#[test]
fn sealed_operator_rejects_writes() -> Result<()> {
    let (graph, key) = GraphBuilder::scope(|b| source(b, 10))?;
    let mut op = graph.get(&key).cloned().ok_or_else(|| anyhow::anyhow!("missing"))?;

    assert!(op.is_sealed());
    assert!(matches!(
        op.set("source", "range:5"),
        Err(GraphError::SealedField { kind: "DataSource", .. })
    ));
    Ok(())
}

#[test]
fn only_explicit_fields_are_tagged() -> Result<()> {
    let mut f = reduction_fields();
    f.set("func", "max")?;

    let tagged = f.to_tagged();
    assert_eq!(tagged.len(), 1);
    assert_eq!(
        tagged.get("func"),
        Some(&TaggedValue {
            type_tag: "string".into(),
            value: FieldValue::String("max".into()),
        })
    );

    let back = Fields::from_tagged("Reduction", OpKind::Reduction.schema(), tagged)?;
    assert_eq!(back, f);
    assert!(back.get_bool("skipna")?);
    Ok(())
}

#[test]
fn decoding_rejects_mismatched_tags_and_names() {
    let schema = OpKind::Reduction.schema();

    let mut wrong_tag = BTreeMap::new();
    wrong_tag.insert(
        "skipna".to_string(),
        TaggedValue {
            type_tag: "int32".into(),
            value: FieldValue::Int32(1),
        },
    );
    assert!(matches!(
        Fields::from_tagged("Reduction", schema, wrong_tag),
        Err(GraphError::Schema(_))
    ));

    let mut wrong_value = BTreeMap::new();
    wrong_value.insert(
        "skipna".to_string(),
        TaggedValue {
            type_tag: "bool".into(),
            value: FieldValue::Int32(1),
        },
    );
    assert!(matches!(
        Fields::from_tagged("Reduction", schema, wrong_value),
        Err(GraphError::Schema(_))
    ));

    let mut unknown = BTreeMap::new();
    unknown.insert(
        "axis".to_string(),
        TaggedValue {
            type_tag: "int32".into(),
            value: FieldValue::Int32(0),
        },
    );
    assert!(matches!(
        Fields::from_tagged("Reduction", schema, unknown),
        Err(GraphError::Schema(_))
    ));
}

#[test]
fn operator_builder_validates_fields() {
    assert!(Operator::new(OpKind::Rebalance).with("n_partitions", 4i32).is_ok());
    assert!(
        Operator::new(OpKind::Rebalance)
            .with("n_partitions", 4i64)
            .is_err()
    );
}
