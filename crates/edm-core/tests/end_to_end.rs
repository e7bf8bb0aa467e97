//! # End-to-End Tests
//!
//! Whole-engine scenarios over the in-memory backend.
//!
//! ## Scenarios
//! - E0: Beam with unit conversion, deep read, deep patch, safe links
//! - E1: BeamState tree with shared sub-objects and relative links
//! - E2: Wildcards, filters and patches over the BeamState tree
//! - E3: Cloning

#![allow(clippy::unwrap_used, clippy::panic)]

use edm_core::{Edm, EdmError, GetOptions, ObjectId, Resolver, Schema, Selection};
use serde_json::{Value, json};

const SPACE: &str = "dms0";

fn get(edm: &Edm, type_name: &str, id: &ObjectId, path: &str) -> Value {
    edm.get_object(SPACE, type_name, id, &GetOptions::at(path))
        .expect("get")
        .into_value()
}

// =============================================================================
// E0: BEAM
// =============================================================================

mod e0_beam {
    use super::*;

    fn beam() -> (Edm, ObjectId) {
        let mut edm = Edm::new();
        edm.define_schema(
            SPACE,
            &json!({
                "Beam": {"length": {"unit": "m"}, "cs": {"link": "CrossSection"}},
                "CrossSection": {"rve": {"link": "RVE"}},
                "RVE": {"origin": {"shape": [3]}}
            }),
            false,
        )
        .expect("schema");
        let id = edm
            .create_object(
                SPACE,
                "Beam",
                &json!({
                    "length": {"value": 2500, "unit": "mm"},
                    "cs": {"rve": {"origin": {"value": [1, 2, 3]}}}
                }),
            )
            .expect("create");
        (edm, id)
    }

    /// E0.1: Lengths are stored and read in the schema unit.
    #[test]
    fn length_is_converted() {
        let (edm, id) = beam();
        assert_eq!(get(&edm, "Beam", &id, "length"), json!({"value": 2.5, "unit": "m"}));
    }

    /// E0.2: Deep reads return the vector; deep patches replace it.
    #[test]
    fn deep_read_and_patch() {
        let (mut edm, id) = beam();
        let origin = get(&edm, "Beam", &id, "cs.rve.origin");
        assert_eq!(origin["value"], json!([1.0, 2.0, 3.0]));

        edm.patch_object(SPACE, "Beam", &id, "cs.rve.origin", &json!({"value": [4, 5, 6]}))
            .expect("patch");
        let origin = get(&edm, "Beam", &id, "cs.rve.origin");
        assert_eq!(origin["value"], json!([4.0, 5.0, 6.0]));

        let err = edm.patch_object(SPACE, "Beam", &id, "cs.rve.origin", &json!({"value": [4, 5]}));
        assert!(matches!(err, Err(EdmError::Validation(_))));
    }

    /// E0.3: Everything on the way to the patched RVE is unsafe to share.
    #[test]
    fn safe_links_exclude_the_path() {
        let (edm, id) = beam();
        let cs = get(&edm, "Beam", &id, "cs")["meta"]["id"].clone();
        let safe = edm
            .safe_links(SPACE, "Beam", &id, &["cs.rve".to_string()])
            .expect("safe links");
        assert!(!safe.contains(&id));
        assert!(!safe.iter().any(|s| json!(s.as_str()) == cs));

        let all = edm.safe_links(SPACE, "Beam", &id, &[]).expect("safe links");
        assert_eq!(all.len(), 3);
        assert_eq!(edm.link_graph(SPACE, "Beam", &id).expect("graph").edges.len(), 2);
    }
}

// =============================================================================
// E1: BEAM STATE
// =============================================================================

fn beam_state_schema() -> Value {
    json!({
        "BeamState": {
            "beam": {"link": "Beam"},
            "cs": {"link": "CrossSection"},
            "npointz": {"dtype": "i"},
            "csState": {"link": "CrossSectionState", "shape": [-1]}
        },
        "Beam": {
            "length": {"unit": "m"},
            "height": {"unit": "m"},
            "density": {"unit": "kg/m3"},
            "cs": {"link": "CrossSection"}
        },
        "CrossSection": {
            "rvePositions": {"shape": [-1, 3], "unit": "m"},
            "rve": {"link": "ConcreteRVE"}
        },
        "ConcreteRVE": {
            "origin": {"shape": [3], "unit": "m"},
            "size": {"shape": [3], "unit": "m"},
            "ct": {"link": "CTScan"},
            "materials": {"link": "MaterialRecord", "shape": [-1]}
        },
        "CTScan": {"id": {"dtype": "str"}},
        "MaterialRecord": {"name": {"dtype": "str"}, "props": {"dtype": "object"}},
        "CrossSectionState": {
            "eps_axial": {"unit": "um/m"},
            "bendingMoment": {"unit": "kN*m"},
            "rveStates": {"link": "ConcreteRVEState", "shape": [-1]}
        },
        "ConcreteRVEState": {
            "rve": {"link": "ConcreteRVE"},
            "sigmaHom": {"unit": "MPa"}
        }
    })
}

fn beam_state_data() -> Value {
    json!({
        "beam": {
            "length": {"value": 2500, "unit": "mm"},
            "height": {"value": 20, "unit": "cm"},
            "density": {"value": 3.5, "unit": "g/cm3"},
            "cs": {
                "rvePositions": {"value": [[1, 2, 3], [4, 5, 6]], "unit": "mm"},
                "rve": {
                    "origin": {"value": [5, 5, 5], "unit": "mm"},
                    "size": {"value": [150, 161, 244], "unit": "um"},
                    "ct": {"id": "scan-000"},
                    "materials": [
                        {"name": "mat0", "props": {"origin": "CZ", "year": 2018, "quality": "good"}},
                        {"name": "mat1", "props": {"origin": "PL", "year": 2016, "project": "HTL-344PRP"}}
                    ]
                }
            }
        },
        "cs": ".beam.cs",
        "npointz": 2,
        "csState": [
            {
                "eps_axial": {"value": 344, "unit": "um/m"},
                "bendingMoment": {"value": 869, "unit": "kN*m"},
                "rveStates": [
                    {"rve": "...beam.cs.rve", "sigmaHom": {"value": 89.5, "unit": "MPa"}},
                    {"rve": "...beam.cs.rve", "sigmaHom": {"value": 81.4, "unit": "MPa"}}
                ]
            },
            {
                "eps_axial": {"value": 878, "unit": "um/m"},
                "bendingMoment": {"value": 123, "unit": "kN*m"},
                "rveStates": [
                    {"rve": "...beam.cs.rve", "sigmaHom": {"value": 55.6, "unit": "MPa"}}
                ]
            }
        ]
    })
}

fn beam_state() -> (Edm, ObjectId) {
    let mut edm = Edm::new();
    edm.define_schema(SPACE, &beam_state_schema(), false)
        .expect("schema");
    let id = edm
        .create_object(SPACE, "BeamState", &beam_state_data())
        .expect("create");
    (edm, id)
}

fn object_total(edm: &Edm) -> usize {
    edm.list_types(SPACE)
        .expect("types")
        .iter()
        .map(|t| edm.list_objects(SPACE, t).expect("list").len())
        .sum()
}

mod e1_beam_state {
    use super::*;

    /// E1.1: Relative links point at the object created earlier.
    #[test]
    fn relative_links_share_objects() {
        let (edm, id) = beam_state();
        assert_eq!(edm.list_objects(SPACE, "BeamState").expect("list"), vec![id.clone()]);
        assert_eq!(edm.list_objects(SPACE, "CrossSection").expect("list").len(), 1);
        assert_eq!(edm.list_objects(SPACE, "ConcreteRVE").expect("list").len(), 1);
        assert_eq!(object_total(&edm), 12);

        let d = get(&edm, "BeamState", &id, "");
        assert_eq!(d["cs"]["meta"]["id"], d["beam"]["cs"]["meta"]["id"]);
        assert_eq!(d["beam"]["length"]["unit"], json!("m"));
        assert_eq!(d["beam"]["length"]["value"].as_f64(), Some(2.5));
        assert_eq!(d["meta"]["type"], json!("BeamState"));
        assert_eq!(d["beam"]["meta"]["type"], json!("Beam"));
        assert_eq!(d["beam"]["meta"]["parent"], json!(id.as_str()));
        assert_eq!(d["npointz"], json!({"value": 2}));
    }

    /// E1.2: Tracking export reproduces the relative links.
    #[test]
    fn tracking_export() {
        let (edm, id) = beam_state();
        let opts = GetOptions {
            tracking: true,
            include_meta: false,
            ..GetOptions::default()
        };
        let d = edm
            .get_object(SPACE, "BeamState", &id, &opts)
            .expect("get")
            .into_value();
        assert_eq!(d["cs"], json!(".beam.cs"));
        assert_eq!(d["csState"][0]["rveStates"][0]["rve"], json!("...beam.cs.rve"));
        assert_eq!(d["csState"][1]["rveStates"][0]["rve"], json!("...beam.cs.rve"));
        assert!(d.get("meta").is_none());
    }

    /// E1.3: Depth zero leaves out every link.
    #[test]
    fn max_depth_zero() {
        let (edm, id) = beam_state();
        let opts = GetOptions {
            tracking: true,
            include_meta: false,
            max_depth: Some(0),
            ..GetOptions::default()
        };
        let d = edm
            .get_object(SPACE, "BeamState", &id, &opts)
            .expect("get")
            .into_value();
        assert!(d.get("cs").is_none());
        assert!(d.get("npointz").is_some());
    }

    /// E1.4: Conversion keeps precision.
    #[test]
    fn float_conversion() {
        let (mut edm, _) = beam_state();
        let id = edm
            .create_object(
                SPACE,
                "Beam",
                &json!({
                    "length": {"value": 1, "unit": "km"},
                    "height": {"value": 12.3456789, "unit": "cm"},
                    "density": {"value": 3.456789, "unit": "g/cm3"}
                }),
            )
            .expect("create");
        let b = get(&edm, "Beam", &id, "height");
        assert_eq!(b["unit"], json!("m"));
        assert!(b["value"].as_f64().expect("number") > 0.123_456_7);
        assert_eq!(get(&edm, "Beam", &id, "length")["value"].as_f64(), Some(1000.0));
    }

    /// E1.5: A relative link to an object not created yet is rejected
    /// before anything is stored.
    #[test]
    fn forward_reference_rejected() {
        let (mut edm, _) = beam_state();
        let before = object_total(&edm);
        let mut data = beam_state_data();
        data["csState"][0]["rveStates"][0]["rve"] = json!("...csState[1].rveStates[0].rve");
        assert!(matches!(
            edm.create_object(SPACE, "BeamState", &data),
            Err(EdmError::Resolution(_))
        ));
        assert_eq!(object_total(&edm), before);
    }

    /// E1.6: Existing objects are linked by id.
    #[test]
    fn link_existing_by_id() {
        let (mut edm, id) = beam_state();
        let beam = get(&edm, "BeamState", &id, "beam")["meta"]["id"].clone();
        let other = edm
            .create_object(SPACE, "BeamState", &json!({"beam": beam, "npointz": 1}))
            .expect("create");
        assert_eq!(get(&edm, "BeamState", &other, "beam")["meta"]["id"], beam);

        let missing = json!({"beam": ObjectId::from_counter(9999).as_str()});
        assert!(matches!(
            edm.create_object(SPACE, "BeamState", &missing),
            Err(EdmError::NotFound(_))
        ));
    }
}

// =============================================================================
// E2: PATHS, FILTERS, PATCHES
// =============================================================================

mod e2_paths {
    use super::*;

    fn resolve_count(edm: &Edm, id: &ObjectId, path: &str) -> usize {
        let schema = Schema::from_value(&edm.get_schema(SPACE).expect("schema")).expect("parse");
        Resolver::new(edm.backend(), &schema, SPACE)
            .resolve("BeamState", id, &path.parse().expect("path"))
            .expect("resolve")
            .paths
            .len()
    }

    /// E2.1: Resolution results and tails.
    #[test]
    fn resolution() {
        let (edm, id) = beam_state();
        let schema = Schema::from_value(&edm.get_schema(SPACE).expect("schema")).expect("parse");
        let resolver = Resolver::new(edm.backend(), &schema, SPACE);

        let r = resolver
            .resolve("BeamState", &id, &"cs.rve.origin".parse().expect("path"))
            .expect("resolve");
        assert_eq!(r.paths.len(), 1);
        assert_eq!(r.paths[0].tail.as_ref().map(|t| t.attr.as_str()), Some("origin"));

        let r = resolver
            .resolve("BeamState", &id, &"cs.rve".parse().expect("path"))
            .expect("resolve");
        assert!(r.paths[0].tail.is_none());

        let fwd = resolver
            .resolve("BeamState", &id, &"csState[:]".parse().expect("path"))
            .expect("resolve");
        let rev = resolver
            .resolve("BeamState", &id, &"csState[::-1]".parse().expect("path"))
            .expect("resolve");
        assert_eq!(fwd.paths.len(), 2);
        assert_eq!(rev.paths[1].id(), fwd.paths[0].id());

        assert_eq!(
            resolve_count(&edm, &id, "csState[:].rveStates[:].rve.materials[:].name"),
            6
        );
    }

    /// E2.2: Plain paths give one value, wildcards give lists.
    #[test]
    fn selections() {
        let (edm, id) = beam_state();
        let one = edm
            .get_object(SPACE, "BeamState", &id, &GetOptions::at("csState[0].bendingMoment"))
            .expect("get");
        assert!(matches!(one, Selection::One(Value::Object(_))));
        let many = edm
            .get_object(SPACE, "BeamState", &id, &GetOptions::at("csState[0:1].bendingMoment"))
            .expect("get");
        assert!(matches!(many, Selection::Many(ref v) if v.len() == 1));

        let names = get(&edm, "BeamState", &id, "csState[:].rveStates[:].rve.materials[:].name");
        assert_eq!(names, json!(["mat0", "mat1", "mat0", "mat1", "mat0", "mat1"]));

        assert_eq!(
            get(&edm, "BeamState", &id, "csState[::-1].bendingMoment"),
            get(&edm, "BeamState", &id, "csState[1,0].bendingMoment")
        );
    }

    /// E2.3: Filters select by attributes, links and comprehensions.
    #[test]
    fn filters() {
        let (edm, id) = beam_state();
        let count = |p: &str| get(&edm, "BeamState", &id, p).as_array().map_or(0, Vec::len);
        assert_eq!(count("csState[:|len(rveStates)<2]"), 1);
        let ids = |p: &str| -> Vec<Value> {
            get(&edm, "BeamState", &id, p)
                .as_array()
                .map(|items| items.iter().map(|v| v["meta"]["id"].clone()).collect())
                .unwrap_or_default()
        };
        let all = ids("csState[::-1]");
        assert_eq!(ids("csState[::-1|len(rveStates)>0]"), all);
        assert_eq!(ids("csState[::-1|len(rveStates)<2]"), all[..1].to_vec());
        assert_eq!(ids(r#"csState[:|eps_axial["value"]<800]"#), all[1..].to_vec());
        assert_eq!(
            count(r#"csState[:|all([rs.sigmaHom["value"]>80 for rs in rveStates])]"#),
            1
        );
        assert_eq!(
            resolve_count(
                &edm,
                &id,
                r#"csState[:].rveStates[:].rve.materials[:|name.endswith("0")].name"#
            ),
            3
        );
        assert_eq!(resolve_count(&edm, &id, r#"csState[:|eps_axial["value"]<800]"#), 1);
        assert_eq!(
            resolve_count(&edm, &id, r#"csState[:].rveStates[:|sigmaHom["value"]<85]"#),
            2
        );
        assert!(matches!(
            edm.get_object(SPACE, "BeamState", &id, &GetOptions::at("csState[:|some_nonsense_filter]")),
            Err(EdmError::Resolution(_))
        ));
    }

    /// E2.4: Plain and wildcard patches; count and shape errors.
    #[test]
    fn patches() {
        let (mut edm, id) = beam_state();
        edm.patch_object(
            SPACE,
            "BeamState",
            &id,
            "csState[0].bendingMoment",
            &json!({"value": 44, "unit": "kN*m"}),
        )
        .expect("plain patch");
        let m = get(&edm, "BeamState", &id, "csState[0].bendingMoment");
        assert_eq!(m["value"].as_f64(), Some(44.0));
        assert_eq!(m["unit"], json!("kN*m"));

        let written = edm
            .patch_object(
                SPACE,
                "BeamState",
                &id,
                "csState[0:2].bendingMoment",
                &json!([{"value": 55, "unit": "kN*m"}, {"value": 66000, "unit": "N*m"}]),
            )
            .expect("wildcard patch");
        assert_eq!(written, 2);
        let back = get(&edm, "BeamState", &id, "csState[::-1].bendingMoment");
        assert_eq!(back[0]["value"].as_f64(), Some(66.0));
        assert_eq!(back[1]["value"].as_f64(), Some(55.0));

        let too_few = edm.patch_object(
            SPACE,
            "BeamState",
            &id,
            "csState[0:2].bendingMoment",
            &json!([{"value": 77, "unit": "kN*m"}]),
        );
        assert!(matches!(too_few, Err(EdmError::Precondition(_))));

        let not_list = edm.patch_object(
            SPACE,
            "BeamState",
            &id,
            "csState[0:1].bendingMoment",
            &json!({"value": 88, "unit": "kN*m"}),
        );
        assert!(matches!(not_list, Err(EdmError::Precondition(_))));

        let unsubscripted =
            edm.patch_object(SPACE, "BeamState", &id, "csState.bendingMoment", &json!([]));
        assert!(matches!(unsubscripted, Err(EdmError::Resolution(_))));

        // A failing value in a wildcard patch writes nothing.
        let mixed = edm.patch_object(
            SPACE,
            "BeamState",
            &id,
            "csState[:].bendingMoment",
            &json!([{"value": 1, "unit": "kN*m"}, {"value": 1, "unit": "kg"}]),
        );
        assert!(matches!(mixed, Err(EdmError::Validation(_))));
        let still = get(&edm, "BeamState", &id, "csState[0].bendingMoment");
        assert_eq!(still["value"].as_f64(), Some(55.0));
    }

    /// E2.5: Safe links keep everything off the targeted paths.
    #[test]
    fn safe_links() {
        let (edm, id) = beam_state();
        let beam = get(&edm, "BeamState", &id, "beam")["meta"]["id"].clone();
        let safe = edm
            .safe_links(
                SPACE,
                "BeamState",
                &id,
                &["csState[0].rveStates[:].sigmaHom".to_string()],
            )
            .expect("safe links");
        assert!(!safe.contains(&id));
        assert!(safe.iter().any(|s| json!(s.as_str()) == beam));
        // 12 objects, 4 on the way: root, csState[0] and its two states.
        assert_eq!(safe.len(), 8);
        let mut sorted = safe.clone();
        sorted.sort();
        assert_eq!(sorted, safe);
    }
}

// =============================================================================
// E3: CLONE
// =============================================================================

mod e3_clone {
    use super::*;

    /// E3.1: A deep clone copies every object once and keeps sharing.
    #[test]
    fn deep_clone() {
        let (mut edm, id) = beam_state();
        let copy = edm
            .clone_object(SPACE, "BeamState", &id, &[])
            .expect("clone");
        assert_ne!(copy, id);
        assert_eq!(object_total(&edm), 24);

        let d = get(&edm, "BeamState", &copy, "");
        let orig = get(&edm, "BeamState", &id, "");
        assert_eq!(d["meta"]["upstream"], json!(id.as_str()));
        assert_eq!(d["cs"]["meta"]["id"], d["beam"]["cs"]["meta"]["id"]);
        assert_ne!(d["cs"]["meta"]["id"], orig["cs"]["meta"]["id"]);
        assert_eq!(d["beam"]["meta"]["upstream"], orig["beam"]["meta"]["id"]);
        assert_eq!(
            d["csState"][1]["rveStates"][0]["rve"]["meta"]["id"],
            d["cs"]["rve"]["meta"]["id"]
        );
        assert_eq!(
            get(&edm, "BeamState", &copy, "csState[:].rveStates[:].rve.materials[:].name"),
            get(&edm, "BeamState", &id, "csState[:].rveStates[:].rve.materials[:].name")
        );
    }

    /// E3.2: Shallow ids are linked, not copied.
    #[test]
    fn shallow_clone_shares() {
        let (mut edm, id) = beam_state();
        let beam: ObjectId = serde_json::from_value(
            get(&edm, "BeamState", &id, "beam")["meta"]["id"].clone(),
        )
        .expect("id");
        let copy = edm
            .clone_object(SPACE, "BeamState", &id, std::slice::from_ref(&beam))
            .expect("clone");
        let d = get(&edm, "BeamState", &copy, "");
        assert_eq!(d["beam"]["meta"]["id"], json!(beam.as_str()));
        assert_eq!(edm.list_objects(SPACE, "Beam").expect("list").len(), 1);
    }
}
