use std::path::PathBuf;

use mapwire::net::registry::{PacketRegistry, DEFAULT_MAX_VARIABLE_LENGTH};

fn main() -> Result<(), String> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/db/packet_db.yml")));
    let registry =
        PacketRegistry::load(&path, DEFAULT_MAX_VARIABLE_LENGTH).map_err(|err| err.to_string())?;

    let mut missing_handlers = Vec::new();
    for schema in registry.iter() {
        let epochs: Vec<String> = schema
            .layouts
            .keys()
            .map(|since| since.to_string())
            .collect();
        println!(
            "{:#06x} {:<20} since [{}]{}{}",
            schema.opcode,
            schema.name,
            epochs.join(", "),
            if schema.pre_auth { " pre_auth" } else { "" },
            schema
                .handler
                .as_deref()
                .map(|name| format!(" -> {name}"))
                .unwrap_or_default()
        );
        if schema.pre_auth && schema.handler.is_none() {
            missing_handlers.push(schema.name.clone());
        }
    }
    for epoch in registry.epochs() {
        let summary = registry.summary(epoch);
        println!(
            "epoch {}: fixed={} variable={} pre_auth={}",
            epoch, summary.fixed, summary.variable, summary.pre_auth
        );
    }
    if !missing_handlers.is_empty() {
        return Err(format!(
            "pre-auth packets without a handler: {}",
            missing_handlers.join(", ")
        ));
    }
    println!("{}: {} opcodes ok", path.display(), registry.len());
    Ok(())
}
