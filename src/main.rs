use std::env;
use std::process;

use serde_json::{Value, json};

use native_interop::backend::layout::{compound_layout, compute_array_layout, type_layout};
use native_interop::engine::{Engine, EngineConfig, ScriptHost};
use native_interop::module::ModuleRecord;
use native_interop::types::{SigKind, TypeRegistry};
use native_interop::{InteropError, InteropResult};

/// Host that only walks the import graph.
struct ListingHost;

impl ScriptHost for ListingHost {
    fn evaluate_module(&self, _module: &ModuleRecord) -> InteropResult<()> {
        Ok(())
    }
}

fn usage(program: &str) -> ! {
    eprintln!("Usage:");
    eprintln!("  {} sizeof <signature>", program);
    eprintln!("  {} layout <signature>", program);
    eprintln!("  {} modules <entry>", program);
    process::exit(2);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("interop");
    if args.len() < 3 {
        usage(program);
    }

    let result = match args[1].as_str() {
        "sizeof" => sizeof(&args[2]),
        "layout" => layout(&args[2]),
        "modules" => modules(&args[2]),
        _ => usage(program),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        process::exit(1);
    }
}

fn sizeof(signature: &str) -> Result<(), InteropError> {
    let mut types = TypeRegistry::new();
    let sig = types.parse(signature)?;
    println!("{}", type_layout(&sig, &types)?.size);
    Ok(())
}

fn layout(signature: &str) -> Result<(), InteropError> {
    let mut types = TypeRegistry::new();
    let sig = types.parse(signature)?;
    let top = type_layout(&sig, &types)?;
    let mut out = json!({
        "signature": sig.to_string(),
        "size": top.size,
        "align": top.align,
    });

    let resolved = types.resolve(&sig)?;
    match &resolved.kind {
        SigKind::Struct(_) | SigKind::Union(_) => {
            let layout = compound_layout(&resolved, &types)?;
            let fields: Vec<Value> = layout
                .fields
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "type": f.ty.to_string(),
                        "offset": f.offset,
                        "size": f.size,
                    })
                })
                .collect();
            out["fields"] = Value::Array(fields);
        }
        SigKind::Array { len, elem } => {
            let elem_layout = compute_array_layout(elem, &types)?;
            out["length"] = json!(len);
            out["element_size"] = json!(elem_layout.element_size);
            out["element_align"] = json!(elem_layout.element_align);
        }
        _ => {}
    }

    match serde_json::to_string_pretty(&out) {
        Ok(text) => println!("{}", text),
        Err(e) => return Err(InteropError::marshal(e.to_string())),
    }
    Ok(())
}

fn modules(entry: &str) -> Result<(), InteropError> {
    let engine = Engine::new(ListingHost, EngineConfig::default());
    engine
        .load_entry(entry)
        .map_err(|e| InteropError::resolution(e.to_string()))?;
    engine.run_event_loop();

    for record in engine.modules().records() {
        let status = match &record.error {
            Some(_) => "error".to_string(),
            None => format!("{:?}", record.state).to_lowercase(),
        };
        println!(
            "{:>3} {:<10} {} {}",
            record.id,
            status,
            record
                .content_hash
                .as_deref()
                .map(|h| h.get(..12).unwrap_or(h))
                .unwrap_or("-"),
            record.path.display()
        );
        if let Some(err) = &record.error {
            eprintln!("{}", err);
        }
    }
    Ok(())
}
