use super::framework::run_suite;

#[test]
fn direct_connection_to_standalone() {
    run_suite(
        r#"{
        "description": "Connect directly to a standalone",
        "seeds": ["a:27017"],
        "phases": [{
            "responses": [["a:27017", { "ok": 1, "ismaster": true, "maxWireVersion": 6 }]],
            "outcome": {
                "servers": { "a:27017": { "type": "Standalone", "setName": null } },
                "topologyType": "Single",
                "setName": null
            }
        }]
    }"#,
    );
}

#[test]
fn direct_connection_to_secondary_stays_single() {
    run_suite(
        r#"{
        "description": "A single seed without a set name is used directly",
        "seeds": ["a:27017"],
        "phases": [{
            "responses": [
                ["a:27017", { "ok": 1, "ismaster": false, "secondary": true, "setName": "rs",
                              "hosts": ["a:27017", "b:27017"] }]
            ],
            "outcome": {
                "servers": { "a:27017": { "type": "RSSecondary", "setName": "rs" } },
                "topologyType": "Single",
                "setName": null
            }
        }]
    }"#,
    );
}

#[test]
fn unavailable_seed() {
    run_suite(
        r#"{
        "description": "An unreachable seed stays Unknown",
        "seeds": ["a:27017"],
        "phases": [{
            "responses": [["a:27017", {}]],
            "outcome": {
                "servers": { "a:27017": { "type": "Unknown", "setName": null } },
                "topologyType": "Single",
                "setName": null
            }
        }]
    }"#,
    );
}

#[test]
fn not_ok_reply_is_unknown() {
    run_suite(
        r#"{
        "description": "A failed handshake leaves the server Unknown",
        "seeds": ["a:27017"],
        "phases": [{
            "responses": [["a:27017", { "ok": 0, "errmsg": "not ready" }]],
            "outcome": {
                "servers": { "a:27017": { "type": "Unknown", "setName": null } },
                "topologyType": "Single",
                "setName": null
            }
        }]
    }"#,
    );
}
