use embed_js::Context;
use embed_js::Error;
use embed_js::ExecutionContext;
use embed_js::Function;
use embed_js::FunctionArgs;
use embed_js::Isolate;
use embed_js::Value;
use require_js::create_require;
use require_js::run_with_runtime;
use require_js::MemoryFs;
use require_js::ModuleFs;
use require_js::RealFs;
use require_js::Registry;
use require_js::RequireOptions;
use std::sync::Arc;

struct Fixture {
  context: Context,
  ec: ExecutionContext,
  isolate: Isolate,
}

fn fixture() -> Fixture {
  let isolate = Isolate::new().unwrap();
  let ec = isolate.execution_context();
  let context = isolate.new_context(&ec).unwrap();
  Fixture { context, ec, isolate }
}

impl Fixture {
  fn require(&self, fs: MemoryFs, options: &RequireOptions) -> Value {
    let fs: Arc<dyn ModuleFs> = Arc::new(fs);
    let require = create_require(&self.ec, &self.context, fs, "/app/main.js", options).unwrap();
    self.context.global(&self.ec).unwrap().set(&self.ec, "require", &require).unwrap();
    require
  }

  fn eval(&self, code: &str) -> String {
    self
      .context
      .run(&self.ec, code, "test.js")
      .unwrap()
      .string_value(&self.ec)
      .unwrap()
  }
}

#[test]
fn modules_are_evaluated_once() {
  let f = fixture();
  let fs = MemoryFs::new().with_file(
    "/app/counter.js",
    "globalThis.loads = (globalThis.loads || 0) + 1;\nmodule.exports = { n: globalThis.loads };",
  );
  f.require(fs, &RequireOptions::default());
  assert_eq!(
    f.eval("const a = require('./counter'); const b = require('./counter.js'); `${a === b},${a.n},${loads}`"),
    "true,1,1"
  );
}

#[test]
fn module_wrapper_arguments() {
  let f = fixture();
  let fs = MemoryFs::new().with_file(
    "/app/lib/info.js",
    "module.exports = [__filename, __dirname, module.id, module.filename, typeof require, this === globalThis].join();",
  );
  f.require(fs, &RequireOptions::default());
  assert_eq!(
    f.eval("require('./lib/info')"),
    "/app/lib/info.js,/app/lib,/app/lib/info.js,/app/lib/info.js,function,true"
  );
}

#[test]
fn exports_conditions_select_the_target() {
  let package = || {
    MemoryFs::new()
      .with_file("/app/node_modules/pkg/s.js", "module.exports = 'solid';")
      .with_file("/app/node_modules/pkg/d.js", "module.exports = 'default';")
      .with_file(
        "/app/node_modules/pkg/package.json",
        r#"{"exports": {"solid": "./s.js", "default": "./d.js"}}"#,
      )
  };
  let f = fixture();
  f.require(package(), &RequireOptions::default());
  assert_eq!(f.eval("require('pkg')"), "solid");

  let f = fixture();
  f.require(package(), &RequireOptions::default().with_conditions(&["node", "default"]));
  assert_eq!(f.eval("require('pkg')"), "default");
}

#[test]
fn require_cycles_see_partial_exports() {
  let f = fixture();
  let fs = MemoryFs::new()
    .with_file("/app/a.js", "exports.name = 'a';\nexports.b = require('./b');")
    .with_file("/app/b.js", "const a = require('./a');\nmodule.exports = { a, sawName: a.name };");
  f.require(fs, &RequireOptions::default());
  assert_eq!(
    f.eval("const a = require('./a'); `${a.b.a === a},${a.b.sawName},${a.name}`"),
    "true,a,a"
  );
}

#[test]
fn require_cycles_with_reassigned_exports_see_the_initial_exports() {
  let f = fixture();
  let fs = MemoryFs::new()
    .with_file("/app/a.js", "module.exports = { b: require('./b') };")
    .with_file("/app/b.js", "module.exports = { a: require('./a') };");
  f.require(fs, &RequireOptions::default());
  // `b` ran while `a` still had its initial exports object, which `a` then replaced.
  assert_eq!(
    f.eval(
      "const a = require('./a'); [a.b.a === a, Object.keys(a.b.a).length, require('./a') === a, require('./b') === a.b].join()"
    ),
    "false,0,true,true"
  );
}

#[test]
fn denied_ids_look_missing() {
  let f = fixture();
  let fs = MemoryFs::new().with_file("/app/secret.js", "module.exports = 1;");
  f.require(fs, &RequireOptions::default().deny("./secret"));
  assert_eq!(
    f.eval("try { require('./secret'); 'loaded' } catch (e) { e.message }"),
    "unable to resolve: ./secret in /app"
  );
  assert_eq!(
    f.eval("try { require('./nothing'); 'loaded' } catch (e) { e.message }"),
    "unable to resolve: ./nothing in /app"
  );
}

#[test]
fn failed_modules_fail_again() {
  let f = fixture();
  let fs = MemoryFs::new().with_file(
    "/app/bad.js",
    "globalThis.attempts = (globalThis.attempts || 0) + 1;\nthrow new Error('broken module');",
  );
  f.require(fs, &RequireOptions::default());
  assert_eq!(
    f.eval("const m = []; for (let i = 0; i < 2; i++) { try { require('./bad') } catch (e) { m.push(e.message) } } `${m},${attempts}`"),
    "broken module,broken module,1"
  );
}

#[test]
fn json_modules() {
  let f = fixture();
  let fs = MemoryFs::new().with_file("/app/config.json", r#"{"port": 8080, "tags": ["a", "b"]}"#);
  f.require(fs, &RequireOptions::default());
  assert_eq!(f.eval("const c = require('./config'); `${c.port}:${c.tags}`"), "8080:a,b");
}

#[test]
fn default_exports_are_unwrapped() {
  let f = fixture();
  let fs = MemoryFs::new().with_file(
    "/app/esm.js",
    "exports.default = { greet: () => 'hi' };\nexports.extra = 42;",
  );
  f.require(fs, &RequireOptions::default());
  assert_eq!(f.eval("const m = require('./esm'); `${m.greet()},${m.extra},${m.default === m}`"), "hi,42,true");
}

#[test]
fn require_resolve_reports_paths_and_runtimes() {
  let f = fixture();
  let fs = MemoryFs::new()
    .with_file("/app/node_modules/@scope/pkg/package.json", r#"{"main": "lib/entry.js"}"#)
    .with_file("/app/node_modules/@scope/pkg/lib/entry.js", "");
  f.require(fs, &RequireOptions::default());
  assert_eq!(
    f.eval("[require.resolve('@scope/pkg'), require.resolve('module')].join()"),
    "/app/node_modules/@scope/pkg/lib/entry.js,module"
  );
}

#[test]
fn hashbang_lines_are_ignored() {
  let f = fixture();
  let fs = MemoryFs::new().with_file("/app/bin.js", "#!/usr/bin/env node\nmodule.exports = 'ran';");
  f.require(fs, &RequireOptions::default());
  assert_eq!(f.eval("require('./bin')"), "ran");
}

#[test]
fn module_runtime_exposes_module_class() {
  let f = fixture();
  f.require(MemoryFs::new(), &RequireOptions::default());
  assert_eq!(
    f.eval("const { Module } = require('module'); Module._preloadModules(); `${typeof Module},${new Module() instanceof Module},${require('module') === require('module')}`"),
    "function,true,true"
  );
  assert_eq!(f.eval("JSON.stringify(Object.keys(require('vm')))"), "[]");
}

#[test]
fn registered_runtimes() {
  let f = fixture();
  let registry = Arc::new(Registry::with_builtins());
  registry.register_runtime(
    "host",
    "host",
    Arc::new(|args: &FunctionArgs| {
      let exports = args.arg(1).cloned().ok_or_else(|| Error::msg("no exports"))?;
      exports.set(&args.ec, "answer", &42)?;
      args.context.undefined(&args.ec)
    }),
  );
  let library: Arc<dyn ModuleFs> = Arc::new(
    MemoryFs::new()
      .with_file("/lib/util.js", "module.exports = { twice: (n) => require('./helper').mul(n, 2) };")
      .with_file("/lib/helper.js", "exports.mul = (a, b) => a * b;"),
  );
  registry.register_runtime_library("util", library, "/lib/util.js");
  f.require(MemoryFs::new(), &RequireOptions::default().with_registry(registry));
  assert_eq!(f.eval("`${require('host').answer},${require('util').twice(21)}`"), "42,42");
}

#[test]
fn extensions_can_be_replaced_from_script() {
  let f = fixture();
  let fs = MemoryFs::new().with_file("/app/page.txt", "hello");
  f.require(fs, &RequireOptions::default());
  assert_eq!(
    f.eval(
      "require.extensions['.txt'] = (module, filename) => { module.exports = module.fs.readFileSync(filename, 'utf8').toUpperCase(); };\n\
       require('./page')"
    ),
    "HELLO"
  );
}

#[test]
fn module_fs_is_visible_to_script() {
  let f = fixture();
  let fs = MemoryFs::new().with_file("/app/data/x.bin", [1u8, 2, 3]).with_file(
    "/app/probe.js",
    "const s = module.fs.statSync('/app/data');\n\
     const b = new Uint8Array(module.fs.readFileSync('/app/data/x.bin'));\n\
     module.exports = `${s.isDirectory()},${s.isFile()},${b.length},${module.fs.existsSync('/app/nope')}`;",
  );
  f.require(fs, &RequireOptions::default());
  assert_eq!(f.eval("require('./probe')"), "true,false,3,false");
}

#[test]
fn dynamic_import_requires_relative_to_the_module() {
  let f = fixture();
  let fs = MemoryFs::new()
    .with_file("/app/lib/loader.js", "module.exports = () => import('./lazy');")
    .with_file("/app/lib/lazy.js", "module.exports = { value: 'lazy' };");
  f.require(fs, &RequireOptions::default());
  let promise = f.context.run(&f.ec, "require('./lib/loader')()", "test.js").unwrap();
  let exports = promise.await_promise(&f.ec).unwrap();
  assert_eq!(exports.get(&f.ec, "value").unwrap().string_value(&f.ec).unwrap(), "lazy");

  // Scripts that are not modules have nothing to resolve against.
  let failed = f.context.run(&f.ec, "import('./lib/lazy')", "test.js").unwrap();
  assert!(failed.await_promise(&f.ec).is_err());
}

#[test]
fn run_with_runtime_prepares_the_environment() {
  let f = fixture();
  let fs: Arc<dyn ModuleFs> = Arc::new(
    MemoryFs::new()
      .with_file("/app/main.js", "module.exports = greet(require('./name'));")
      .with_file("/app/name.json", r#""world""#),
  );
  let exports = run_with_runtime(&f.ec, &f.context, fs, "/app/main.js", &RequireOptions::default(), |args| {
    let greet = Function::named("greet", |args: &FunctionArgs| {
      let name: String = args.arg_as(0)?;
      args.context.create(&args.ec, &format!("hello {name}"))
    });
    args.global.set(args.ec, "greet", &greet)?;
    Ok(())
  })
  .unwrap();
  assert_eq!(exports.string_value(&f.ec).unwrap(), "hello world");
  f.isolate.terminate();
}

#[test]
fn real_file_systems() {
  let dir = tempfile::tempdir().unwrap();
  std::fs::create_dir_all(dir.path().join("src")).unwrap();
  std::fs::write(dir.path().join("src/main.js"), "module.exports = require('./dep') + 1;").unwrap();
  std::fs::write(dir.path().join("src/dep.cjs"), "module.exports = 41;").unwrap();
  let f = fixture();
  let fs: Arc<dyn ModuleFs> = Arc::new(RealFs::rooted(dir.path()));
  let exports = run_with_runtime(&f.ec, &f.context, fs, "/src/main.js", &RequireOptions::default(), |_| Ok(())).unwrap();
  assert_eq!(exports.int64(&f.ec).unwrap(), 42);
}

#[test]
fn contexts_with_require_are_freed_when_dropped() {
  let f = fixture();
  let other = f.isolate.new_context(&f.ec).unwrap();
  assert_eq!(f.isolate.contexts().len(), 2);
  {
    let fs: Arc<dyn ModuleFs> = Arc::new(
      MemoryFs::new()
        .with_file("/app/lib.js", "module.exports = { twice: (n) => n * 2 };")
        .with_file("/app/broken.js", "throw new Error('nope');"),
    );
    let require = create_require(&f.ec, &other, fs, "/app/main.js", &RequireOptions::default()).unwrap();
    other.global(&f.ec).unwrap().set(&f.ec, "require", &require).unwrap();
    let result = other
      .run(
        &f.ec,
        "let failed = false; try { require('./broken') } catch (e) { failed = true } `${require('./lib').twice(21)},${failed}`",
        "main.js",
      )
      .unwrap();
    assert_eq!(result.string_value(&f.ec).unwrap(), "42,true");
  }
  drop(other);
  assert_eq!(f.isolate.contexts().len(), 1);
}
