use bson::{Bson, Document};
use mongodb_topology::connstring::parse_host;
use mongodb_topology::error::Error::ConnectionFailure;
use mongodb_topology::topology::server::{ServerDescription, ServerType};
use mongodb_topology::topology::{TopologyDescription, TopologyType};
use mongodb_topology::Host;

use serde_json::{Map, Value};

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

struct Server {
    set_name: Option<String>,
    stype: ServerType,
}

struct Outcome {
    servers: HashMap<Host, Server>,
    set_name: Option<String>,
    ttype: TopologyType,
}

struct Phase {
    responses: Vec<(Host, Document)>,
    outcome: Outcome,
}

struct Suite {
    description: String,
    seeds: Vec<Host>,
    set_name: Option<String>,
    phases: Vec<Phase>,
}

fn to_bson(value: &Value) -> Bson {
    match *value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(b),
        Value::Number(ref n) => match n.as_i64() {
            Some(i) => Bson::I64(i),
            None => Bson::FloatingPoint(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(ref s) => Bson::String(s.clone()),
        Value::Array(ref arr) => Bson::Array(arr.iter().map(to_bson).collect()),
        Value::Object(ref obj) => Bson::Document(to_document(obj)),
    }
}

fn to_document(object: &Map<String, Value>) -> Document {
    let mut doc = Document::new();
    for (key, value) in object {
        doc.insert(key.clone(), to_bson(value));
    }
    doc
}

fn optional_string(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        Some(&Value::String(ref s)) => Some(s.clone()),
        _ => None,
    }
}

fn read_outcome(object: &Map<String, Value>) -> Outcome {
    let mut servers = HashMap::new();
    if let Some(&Value::Object(ref obj)) = object.get("servers") {
        for (host, json) in obj {
            let doc = json.as_object().expect("`servers` must be an object map.");
            let stype = match doc.get("type") {
                Some(&Value::String(ref s)) => ServerType::from_str(s).unwrap(),
                _ => panic!("`type` must be a string."),
            };
            servers.insert(
                parse_host(host).unwrap(),
                Server {
                    set_name: optional_string(doc, "setName"),
                    stype: stype,
                },
            );
        }
    }

    let ttype = match object.get("topologyType") {
        Some(&Value::String(ref s)) => TopologyType::from_str(s).unwrap(),
        _ => TopologyType::Unknown,
    };

    Outcome {
        servers: servers,
        set_name: optional_string(object, "setName"),
        ttype: ttype,
    }
}

fn read_suite(json: &str) -> Suite {
    let value: Value = serde_json::from_str(json).expect("Invalid JSON suite.");
    let object = value.as_object().expect("A suite must be a JSON object.");

    let seeds = object["seeds"]
        .as_array()
        .expect("No `seeds` array found.")
        .iter()
        .map(|seed| parse_host(seed.as_str().unwrap()).unwrap())
        .collect();

    let phases = object["phases"]
        .as_array()
        .expect("No `phases` array found.")
        .iter()
        .map(|phase| {
            let responses = phase["responses"]
                .as_array()
                .expect("No `responses` array found.")
                .iter()
                .map(|response| {
                    let pair = response.as_array().unwrap();
                    let host = parse_host(pair[0].as_str().unwrap()).unwrap();
                    (host, to_document(pair[1].as_object().unwrap()))
                })
                .collect();
            let outcome = read_outcome(phase["outcome"].as_object().expect("No `outcome` object found."));
            Phase {
                responses: responses,
                outcome: outcome,
            }
        })
        .collect();

    Suite {
        description: optional_string(object, "description").unwrap_or_default(),
        seeds: seeds,
        set_name: optional_string(object, "setName"),
        phases: phases,
    }
}

/// Feeds every phase's handshake replies through the description state
/// machine and checks the outcome. An empty reply simulates a network error.
pub fn run_suite(json: &str) {
    let suite = read_suite(json);
    let mut topology = TopologyDescription::new(&suite.seeds, suite.set_name.clone());

    for (i, phase) in suite.phases.iter().enumerate() {
        for &(ref host, ref response) in &phase.responses {
            let description = if response.is_empty() {
                ServerDescription::unknown_with_error(
                    host.clone(),
                    ConnectionFailure("Simulated network error.".to_owned()),
                )
            } else {
                ServerDescription::from_is_master(host.clone(), response, Duration::from_millis(1))
            };
            topology.update(description);
        }

        let context = format!("{} (phase {})", suite.description, i);
        assert_eq!(phase.outcome.servers.len(), topology.servers.len(), "{}", context);
        for (host, server) in &phase.outcome.servers {
            match topology.server(host) {
                Some(description) => {
                    assert_eq!(server.set_name, description.set_name, "{}: {}", context, host);
                    assert_eq!(server.stype, description.server_type, "{}: {}", context, host);
                }
                None => panic!("{}: missing host {} in outcome.", context, host),
            }
        }

        assert_eq!(phase.outcome.set_name, topology.set_name, "{}", context);
        assert_eq!(phase.outcome.ttype, topology.topology_type, "{}", context);
    }
}
