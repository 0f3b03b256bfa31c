use clap::Parser;
use embed_js::Context;
use embed_js::Error;
use embed_js::ExecutionContext;
use embed_js::FunctionArgs;
use embed_js::Isolate;
use require_js::run_with_runtime;
use require_js::ModuleFs;
use require_js::RealFs;
use require_js::RequireOptions;
use require_js::RuntimeArgs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "embed-js", version, about = "Run a CommonJS script in an embedded V8 isolate")]
struct Cli {
  /// Entry script.
  script: PathBuf,

  /// Arguments exposed to the script as `process.argv`, after the script path.
  #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
  args: Vec<String>,

  /// Engine flags, passed through verbatim (e.g. "--max-old-space-size=64").
  #[arg(long, value_name = "FLAGS", allow_hyphen_values = true)]
  v8_flags: Option<String>,

  /// Expose `gc()` to script.
  #[arg(long)]
  expose_gc: bool,

  /// Print heap statistics as JSON to stderr once the script has run.
  #[arg(long)]
  heap_stats: bool,

  /// Print the entry module's exports as JSON.
  #[arg(long)]
  print: bool,

  /// Package `exports` conditions in order of preference. Replaces the default list.
  #[arg(long = "condition", value_name = "NAME")]
  conditions: Vec<String>,

  /// Module ids that must never be loaded.
  #[arg(long, value_name = "ID")]
  deny: Vec<String>,

  /// Emit tracing spans and events as JSON to stderr.
  #[arg(long)]
  trace: bool,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.trace);
  match run(&cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("{err}");
      ExitCode::FAILURE
    }
  }
}

fn run(cli: &Cli) -> Result<(), Error> {
  let mut flags = cli.v8_flags.clone().unwrap_or_default();
  if cli.expose_gc {
    flags.push_str(" --expose-gc");
  }
  if !flags.trim().is_empty() {
    embed_js::set_flags(flags.trim());
  }

  let script = std::fs::canonicalize(&cli.script).map_err(Error::host)?;
  let path = script.to_string_lossy().replace('\\', "/");

  let isolate = Isolate::new()?;
  let ec = isolate.execution_context();
  let context = isolate.new_context(&ec)?;

  let mut options = RequireOptions::default();
  if !cli.conditions.is_empty() {
    options.conditions = cli.conditions.clone();
  }
  options.deny.extend(cli.deny.iter().cloned());

  let fs: Arc<dyn ModuleFs> = Arc::new(RealFs::new());
  let argv: Vec<String> = std::iter::once(path.clone()).chain(cli.args.iter().cloned()).collect();
  let exports = run_with_runtime(&ec, &context, fs, &path, &options, |args| install_process(args, &argv));
  let result = exports.and_then(|exports| {
    if cli.print {
      let json = exports.marshal_json(&ec)?;
      println!("{}", String::from_utf8_lossy(&json));
    }
    Ok(())
  });

  if cli.heap_stats {
    print_heap_stats(&ec, &isolate)?;
  }
  context.release();
  isolate.terminate();
  result
}

/// Replaces the default console, which only logs through tracing, with one writing to the
/// standard streams, and exposes `process.argv`.
fn install_process(args: &RuntimeArgs<'_>, argv: &[String]) -> Result<(), Error> {
  let ec = args.ec;
  let context: &Context = args.context;
  let console = context.new_object(ec)?;
  for method in ["log", "info", "debug", "warn", "error"] {
    let function = context.create_function(ec, Some(method), move |args: &FunctionArgs| {
      let mut line = Vec::with_capacity(args.args.len());
      for arg in &args.args {
        line.push(arg.string_value(&args.ec)?);
      }
      match method {
        "warn" | "error" => eprintln!("{}", line.join(" ")),
        _ => println!("{}", line.join(" ")),
      }
      args.context.undefined(&args.ec)
    })?;
    console.set(ec, method, &function)?;
  }
  args.global.set(ec, "console", &console)?;

  let process = context.new_object(ec)?;
  process.set(ec, "argv", &argv.to_vec())?;
  args.global.set(ec, "process", &process)
}

fn print_heap_stats(ec: &ExecutionContext, isolate: &Isolate) -> Result<(), Error> {
  let stats = isolate.heap_statistics(ec)?;
  let json = serde_json::to_string_pretty(&stats).map_err(Error::host)?;
  eprintln!("{json}");
  Ok(())
}

fn init_tracing(enabled: bool) {
  if !enabled {
    return;
  }
  let _ = tracing_subscriber::fmt()
    .with_span_events(FmtSpan::CLOSE)
    .with_max_level(Level::DEBUG)
    .with_writer(std::io::stderr)
    .json()
    .with_ansi(false)
    .try_init();
}
