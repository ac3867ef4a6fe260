use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const CONTRACTS_DIR: &str = "contracts/v1";

/// Every envelope crossing the boundary or the control channel, in manifest
/// order. A missing or unlisted schema file fails the build.
const ENVELOPES: &[&str] = &[
    "relay-request",
    "relay-response",
    "bridge-request",
    "bridge-response",
    "control-signal",
];

struct Envelope {
    name: &'static str,
    title: String,
    id: String,
    sha256: String,
    body: String,
}

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .ancestors()
        .nth(2)
        .expect("workspace root above crates/enhancer-contracts");
    let contracts_dir = workspace_root.join(CONTRACTS_DIR);
    println!("cargo:rerun-if-changed={}", contracts_dir.display());

    reject_unlisted_schemas(&contracts_dir);

    let envelopes: Vec<Envelope> = ENVELOPES
        .iter()
        .map(|name| load_envelope(&contracts_dir, name))
        .collect();

    // Set hash covers names and bodies in manifest order.
    let mut set_hasher = Sha256::new();
    for envelope in &envelopes {
        set_hasher.update(envelope.name.as_bytes());
        set_hasher.update([0]);
        set_hasher.update(envelope.body.as_bytes());
        set_hasher.update([0]);
    }
    let set_sha256 = hex(&set_hasher.finalize());
    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut out = format!(
        "pub const GENERATED_CONTRACTS_SET_SHA256: &str = {set_sha256:?};\n\
         pub const GENERATED_AT_RFC3339: &str = {generated_at:?};\n\
         pub const GENERATED_CONTRACTS_DIR: &str = {CONTRACTS_DIR:?};\n\
         pub const GENERATED_CONTRACT_SCHEMAS: &[ContractSchemaManifest] = &[\n"
    );
    for envelope in &envelopes {
        out.push_str(&format!(
            "    ContractSchemaManifest {{ name: {:?}, title: {:?}, id: {:?}, sha256: {:?}, body: {:?} }},\n",
            envelope.name, envelope.title, envelope.id, envelope.sha256, envelope.body
        ));
    }
    out.push_str("];\n");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_dir.join("generated_contracts.rs"), out).expect("write generated_contracts.rs");
}

fn reject_unlisted_schemas(dir: &Path) {
    let entries = fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("read {}: {e}", dir.display()));
    for entry in entries.filter_map(Result::ok) {
        let file_name = entry.file_name();
        let Some(name) = file_name
            .to_str()
            .and_then(|v| v.strip_suffix(".schema.json"))
        else {
            continue;
        };
        if !ENVELOPES.contains(&name) {
            panic!("{name}.schema.json is not a known envelope; add it to ENVELOPES");
        }
    }
}

fn load_envelope(dir: &Path, name: &'static str) -> Envelope {
    let file_name = format!("{name}.schema.json");
    let path = dir.join(&file_name);
    println!("cargo:rerun-if-changed={}", path.display());

    let body = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("envelope schema {} missing: {e}", path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|e| panic!("envelope schema {} is not JSON: {e}", path.display()));

    let id = schema
        .get("$id")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("{file_name} has no $id"));
    if !id.ends_with(&format!("/{CONTRACTS_DIR}/{file_name}")) {
        panic!("{file_name} has $id {id} outside {CONTRACTS_DIR}");
    }
    let title = schema
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("{file_name} has no title"));

    Envelope {
        name,
        title: title.to_string(),
        id: id.to_string(),
        sha256: hex(&Sha256::digest(body.as_bytes())),
        body,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
