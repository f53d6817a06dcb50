//! Builds the ad hoc in-memory route table this reference binary serves.
//!
//! Concrete data clients (file watchers, KV stores, cluster APIs) are out of
//! scope; this plays the same role an ad hoc `--map` route builder would,
//! translating a handful of CLI flags directly into route definitions
//! instead of standing up a config-file parser.

use junction_core::route::{BackendDef, RouteDef, SpecRef};
use junction_core::value::Value;

use crate::cli::{Cli, Commands};

pub fn from_cli(cli: &Cli) -> Vec<RouteDef> {
    match &cli.command {
        Some(Commands::Serve { map, .. }) => {
            map.iter().enumerate().map(|(index, entry)| from_mapping(index, entry)).collect()
        }
        None => demo_routes(),
    }
}

fn from_mapping(index: usize, entry: &str) -> RouteDef {
    let (path, target) = entry.split_once('=').unwrap_or((entry, ""));
    let id = format!("serve-{index}");

    if target.starts_with("http://") || target.starts_with("https://") {
        RouteDef {
            id,
            path: Some(path.to_string()),
            predicates: Vec::new(),
            filters: Vec::new(),
            backend: BackendDef::Network(target.to_string()),
            preserve_host: false,
        }
    } else {
        RouteDef {
            id,
            path: Some(path.to_string()),
            predicates: Vec::new(),
            filters: vec![
                SpecRef { name: "status".to_string(), args: vec![Value::Number(200.0)] },
                SpecRef {
                    name: "setResponseHeader".to_string(),
                    args: vec![
                        Value::String("x-junction-demo-text".to_string()),
                        Value::String(target.to_string()),
                    ],
                },
            ],
            backend: BackendDef::Shunt { final_response: true },
            preserve_host: false,
        }
    }
}

/// Routes served when no `--map` entries are given: enough to exercise a
/// shunt backend and a loopback re-entry without any external dependency.
fn demo_routes() -> Vec<RouteDef> {
    vec![
        RouteDef {
            id: "health".to_string(),
            path: Some("/healthz".to_string()),
            predicates: Vec::new(),
            filters: vec![SpecRef { name: "status".to_string(), args: vec![Value::Number(204.0)] }],
            backend: BackendDef::Shunt { final_response: true },
            preserve_host: false,
        },
        RouteDef {
            id: "loopback-demo".to_string(),
            path: Some("/loop".to_string()),
            predicates: Vec::new(),
            filters: Vec::new(),
            backend: BackendDef::Loopback,
            preserve_host: false,
        },
    ]
}
