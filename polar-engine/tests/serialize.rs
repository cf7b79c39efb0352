use indoc::indoc;
use serde_json::{json, Value as Json};

use polar_engine::{
    config::QueryConfig, error::*, events::*, polar::Polar, query::Query, sym, term, terms::*,
    value,
};

fn polar() -> Polar {
    Polar::with_config(QueryConfig {
        timeout_ms: 0,
        ..QueryConfig::default()
    })
}

const POLICY: &str = indoc! {r#"
    {
      "filename": "app.polar",
      "rules": [
        {
          "name": "f",
          "params": [{"parameter": {"value": {"Number": {"Integer": 1}}}}]
        },
        {
          "name": "f",
          "params": [{"parameter": {"value": {"Number": {"Integer": 2}}}}]
        },
        {
          "name": "big",
          "params": [{"parameter": {"value": {"Variable": "x"}}}],
          "body": {"value": {"Expression": {
            "operator": "And",
            "args": [{"value": {"Expression": {
              "operator": "Gt",
              "args": [
                {"value": {"Variable": "x"}},
                {"value": {"Number": {"Integer": 1}}}
              ]
            }}}]
          }}},
          "location": {"row": 2, "column": 0}
        }
      ],
      "queries": [
        {"value": {"Call": {"name": "f", "args": [{"value": {"Number": {"Integer": 2}}}]}}}
      ]
    }
"#};

fn events(query: Query) -> Vec<Json> {
    query
        .map(|event| serde_json::to_value(event.unwrap()).unwrap())
        .collect()
}

#[test]
fn test_load_json_and_query() {
    let polar = polar();
    polar.load_json(POLICY).unwrap();

    let query = polar
        .new_query_from_term(term!(Call {
            name: sym!("f"),
            args: vec![term!(sym!("x"))],
        }))
        .unwrap();
    assert_eq!(
        events(query),
        vec![
            json!({"Result": {"bindings": {"x": {"value": {"Number": {"Integer": 1}}}}}}),
            json!({"Result": {"bindings": {"x": {"value": {"Number": {"Integer": 2}}}}}}),
            json!({"Done": {"result": true}}),
        ]
    );

    let inline = polar.next_inline_query().unwrap().unwrap();
    assert_eq!(events(inline).len(), 2);
    assert!(polar.next_inline_query().unwrap().is_none());
}

#[test]
fn test_load_json_accepts_a_list_of_policies() {
    let polar = polar();
    polar
        .load_json(indoc! {r#"
            [
              {"filename": "a.polar", "rules": [{"name": "a", "params": []}]},
              {"filename": "b.polar", "rules": [{"name": "b", "params": []}]}
            ]
        "#})
        .unwrap();
    let kb = polar.kb.read().unwrap();
    assert!(kb.get_generic_rule(&sym!("a")).is_some());
    assert!(kb.get_generic_rule(&sym!("b")).is_some());
}

#[test]
fn test_malformed_ir_is_a_load_error() {
    let polar = polar();
    let err = polar
        .load_json(r#"{"rules": [{"params": []}]}"#)
        .unwrap_err();
    assert_eq!(err.taxonomy(), ErrorTaxonomy::LoadError);
    assert!(matches!(
        err.kind,
        ErrorKind::Load(LoadError::InvalidIr { .. })
    ));
}

#[test]
fn test_runtime_error_boundary_form() {
    let polar = polar();
    polar.load_json(POLICY).unwrap();

    let mut query = polar
        .new_query_from_term(term!(Call {
            name: sym!("big"),
            args: vec![term!(sym!("y"))],
        }))
        .unwrap();
    let err = query.next_event().unwrap_err();
    assert_eq!(
        err.to_string(),
        "y is an unbound variable at line 3, column 1 in file app.polar"
    );
    let formatted = serde_json::to_value(&err).unwrap();
    assert_eq!(formatted["kind"], json!("UnboundVariableError"));
    assert_eq!(
        formatted["location"],
        json!({"file": "app.polar", "row": 2, "column": 0})
    );
    assert_eq!(
        formatted["details"],
        json!({"Runtime": {"UnboundVariable": {"sym": "y"}}})
    );
}

#[test]
fn test_load_error_boundary_form() {
    let err: PolarError = LoadError::MultipleLoad.into();
    let formatted: FormattedPolarError =
        serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
    assert_eq!(formatted.kind, ErrorTaxonomy::LoadError);
    assert_eq!(formatted.message, err.to_string());
    assert!(formatted.location.is_none());
}

#[test]
fn test_required_rule_types_from_json() {
    let rule_types = r#"
        "rule_types": [
          {"name": "g", "params": [{"parameter": {"value": {"Variable": "x"}}}], "required": true}
        ]
    "#;
    let without_g = format!(r#"{{"filename": "types.polar", {}}}"#, rule_types);
    let err = polar().load_json(&without_g).unwrap_err();
    assert_eq!(err.taxonomy(), ErrorTaxonomy::LoadError);
    assert!(err
        .to_string()
        .starts_with("Missing implementation for required rule g(x)"));

    let with_g = format!(
        r#"{{"filename": "types.polar", "rules": [{{"name": "g", "params": [{{"parameter": {{"value": {{"Number": {{"Integer": 1}}}}}}}}]}}], {}}}"#,
        rule_types
    );
    let polar = polar();
    polar.load_json(&with_g).unwrap();
    assert_eq!(polar.kb.read().unwrap().get_rule_types(&sym!("g")).len(), 1);
}

#[test]
fn test_host_events_serialize() {
    let instance = term!(Value::ExternalInstance(ExternalInstance {
        instance_id: 7,
        constructor: None,
        repr: Some("User<7>".to_owned()),
        class_id: None,
    }));

    let call = QueryEvent::ExternalCall {
        call_id: 2,
        instance: instance.clone(),
        attribute: sym!("name"),
        args: None,
    };
    assert_eq!(
        serde_json::to_value(&call).unwrap(),
        json!({"ExternalCall": {
            "call_id": 2,
            "instance": {"value": {"ExternalInstance": {
                "instance_id": 7,
                "constructor": null,
                "repr": "User<7>",
                "class_id": null
            }}},
            "attribute": "name",
            "args": null
        }})
    );

    let isa = QueryEvent::ExternalIsSubSpecializer {
        call_id: 3,
        instance_id: 7,
        left_class_tag: sym!("Admin"),
        right_class_tag: sym!("User"),
    };
    assert_eq!(
        serde_json::to_value(&isa).unwrap(),
        json!({"ExternalIsSubSpecializer": {
            "call_id": 3,
            "instance_id": 7,
            "left_class_tag": "Admin",
            "right_class_tag": "User"
        }})
    );

    let op = QueryEvent::ExternalOp {
        call_id: 4,
        operator: Operator::Eq,
        args: vec![instance, term!(value!("bob"))],
    };
    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json["ExternalOp"]["operator"], json!("Eq"));
    assert_eq!(json["ExternalOp"]["args"][1], json!({"value": {"String": "bob"}}));
}
