//! The vetted host-function table: the modules guests may import and call.
//!
//! Wrapped modules re-expose a fixed API but route time-of-day reads to a
//! zero stub, file opens through the fs hook, and sockets through the
//! network hook (all via [`CallCtx`]).

use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::Kwargs;
use warden_protocol::protocol::Value;

use crate::worker::CallCtx;

pub(crate) type HostFn =
    fn(&[Value], &Kwargs, &mut CallCtx<'_>) -> Result<Value, SandboxErr>;

pub(crate) fn module_exists(module: &str) -> bool {
    matches!(module, "echo" | "math" | "strings" | "clock" | "fs" | "net")
}

/// Direct attribute fetch: no guest-visible indirection sits between the
/// module table and the function.
pub(crate) fn lookup(module: &str, func: &str) -> Option<HostFn> {
    match (module, func) {
        ("echo", "echo") => Some(echo),
        ("math", "add") => Some(math_add),
        ("math", "mul") => Some(math_mul),
        ("strings", "upper") => Some(strings_upper),
        ("strings", "concat") => Some(strings_concat),
        ("clock", "now") => Some(clock_now),
        ("fs", "read") => Some(fs_read),
        ("fs", "write") => Some(fs_write),
        ("net", "connect") => Some(net_connect),
        _ => None,
    }
}

fn echo(args: &[Value], _kwargs: &Kwargs, _ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    Ok(args.first().cloned().unwrap_or(Value::Null))
}

fn math_add(args: &[Value], _kwargs: &Kwargs, _ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    fold_numbers(args, "math.add", 0.0, 0i64, |a, b| a + b, |a, b| a + b)
}

fn math_mul(args: &[Value], _kwargs: &Kwargs, _ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    fold_numbers(args, "math.mul", 1.0, 1i64, |a, b| a * b, |a, b| a * b)
}

fn fold_numbers(
    args: &[Value],
    what: &str,
    float_init: f64,
    int_init: i64,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> i64,
) -> Result<Value, SandboxErr> {
    let all_ints = args.iter().all(Value::is_i64);
    if all_ints {
        let mut acc = int_init;
        for arg in args {
            let n = arg
                .as_i64()
                .ok_or_else(|| SandboxErr::Sandbox(format!("{what} expects numbers")))?;
            acc = int_op(acc, n);
        }
        return Ok(Value::from(acc));
    }
    let mut acc = float_init;
    for arg in args {
        let n = arg
            .as_f64()
            .ok_or_else(|| SandboxErr::Sandbox(format!("{what} expects numbers")))?;
        acc = float_op(acc, n);
    }
    Ok(Value::from(acc))
}

fn strings_upper(
    args: &[Value],
    _kwargs: &Kwargs,
    _ctx: &mut CallCtx<'_>,
) -> Result<Value, SandboxErr> {
    let text = str_arg(args, 0, "strings.upper")?;
    Ok(Value::String(text.to_uppercase()))
}

fn strings_concat(
    args: &[Value],
    _kwargs: &Kwargs,
    _ctx: &mut CallCtx<'_>,
) -> Result<Value, SandboxErr> {
    let mut out = String::new();
    for (idx, _) in args.iter().enumerate() {
        out.push_str(str_arg(args, idx, "strings.concat")?);
    }
    Ok(Value::String(out))
}

fn clock_now(_args: &[Value], _kwargs: &Kwargs, ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    Ok(ctx.now())
}

fn fs_read(args: &[Value], _kwargs: &Kwargs, ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    let path = str_arg(args, 0, "fs.read")?.to_string();
    ctx.read_file(&path)
}

fn fs_write(args: &[Value], _kwargs: &Kwargs, ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    let path = str_arg(args, 0, "fs.write")?.to_string();
    let data = str_arg(args, 1, "fs.write")?.to_string();
    ctx.write_file(&path, &data)
}

fn net_connect(args: &[Value], _kwargs: &Kwargs, ctx: &mut CallCtx<'_>) -> Result<Value, SandboxErr> {
    let host = str_arg(args, 0, "net.connect")?.to_string();
    let port = args
        .get(1)
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| SandboxErr::Sandbox("net.connect expects (host, port)".to_string()))?;
    ctx.connect(&host, port)
}

fn str_arg<'a>(args: &'a [Value], idx: usize, what: &str) -> Result<&'a str, SandboxErr> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| SandboxErr::Sandbox(format!("{what} expects a string argument #{idx}")))
}
