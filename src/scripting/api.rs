//! Builds the `z.*` and `ObfuscationType.*` globals published to scripts.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::{Ctx, Function, Object};

use crate::registry;

use super::Shared;

/// Install the host API into `ctx`'s global object.
pub(super) fn install<'js, 'ctx>(
    ctx: &Ctx<'js>,
    shared: Rc<RefCell<Shared<'ctx>>>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let obfuscation_type = Object::new(ctx.clone())?;
    for descriptor in registry::descriptors() {
        obfuscation_type.set(descriptor.display_name, descriptor.index)?;
    }
    globals.set("ObfuscationType", obfuscation_type)?;

    let z = Object::new(ctx.clone())?;
    z.set("None", 0)?;
    z.set("Stack", 1)?;
    z.set("Global", 2)?;

    {
        let shared = shared.clone();
        z.set(
            "RegisterClass",
            Function::new(ctx.clone(), move |obj: Object<'js>| {
                let persisted = rquickjs::Persistent::save(&obj.ctx().clone(), obj);
                shared.borrow_mut().config_class = Some(persisted);
            })?,
        )?;
    }

    {
        let shared = shared.clone();
        z.set(
            "RegisterPass",
            Function::new(ctx.clone(), move |kind: i32, options: Object<'js>| {
                register_pass(&shared, kind, options);
            })?,
        )?;
    }

    {
        let shared = shared.clone();
        z.set(
            "AddMetaData",
            Function::new(ctx.clone(), move |s: rquickjs::String<'js>| {
                if let Ok(s) = s.to_string() {
                    shared.borrow_mut().module_metadata.push(s);
                }
            })?,
        )?;
    }

    z.set(
        "log",
        Function::new(ctx.clone(), |msg: rquickjs::Value<'js>| {
            tracing::info!(target: "zyrox::script", "{}", format_js_value(&msg));
        })?,
    )?;

    globals.set("z", z)?;
    Ok(())
}

fn format_js_value(value: &rquickjs::Value<'_>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    format!("{value:?}")
}

/// `z.RegisterPass` — coerces every own enumerable property to `i32` via a
/// stringify-then-parse round trip (quirk preserved intentionally; see
/// spec.md §4.5/§9), reads `PassIterations` first, and requires a current
/// function context.
fn register_pass(shared: &Rc<RefCell<Shared<'_>>>, kind: i32, options: Object<'_>) {
    let mut options_coerced: Vec<(String, i32)> = Vec::new();
    let mut iterations = 0i32;
    if let Ok(keys) = options.keys::<String>().collect::<rquickjs::Result<Vec<_>>>() {
        for key in keys {
            let Ok(value) = options.get::<_, rquickjs::Value>(key.as_str()) else {
                continue;
            };
            let coerced = coerce_to_i32(&value);
            if key == "PassIterations" {
                iterations = coerced;
            }
            options_coerced.push((key, coerced));
        }
    }

    if iterations <= 0 {
        tracing::warn!("RegisterPass({kind}): PassIterations missing or <= 0; skipping");
        return;
    }

    let Some(resolved) = crate::registry::PassKind::from_index(kind as u32) else {
        tracing::error!("RegisterPass: unrecognized obfuscation type index {kind}");
        return;
    };

    let mut shared = shared.borrow_mut();
    let Some((function, _name)) = shared.current_function else {
        tracing::error!("RegisterPass({kind}) called outside a RunOnFunction context; ignoring");
        return;
    };
    shared.metadata.add_pass(function, resolved.code_name(), options_coerced);
}

fn coerce_to_i32(value: &rquickjs::Value<'_>) -> i32 {
    let as_string = if let Some(s) = value.as_string() {
        s.to_string().unwrap_or_default()
    } else if let Some(i) = value.as_int() {
        i.to_string()
    } else if let Some(f) = value.as_float() {
        f.to_string()
    } else {
        return 0;
    };
    as_string.trim().parse::<i32>().unwrap_or(0)
}
