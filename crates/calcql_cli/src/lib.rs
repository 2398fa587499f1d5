//! Command-line interface for calcql.
//!
//! Queries are JSON documents in the resolved query format.
//!
//! # Usage
//!
//! ```bash
//! # Validate queries
//! calcql check query.json
//!
//! # Print the task graph
//! calcql plan query.json
//!
//! # Execute against canned data
//! calcql run query.json --data fixtures.json --config config.json
//!
//! # Evaluate a directive expression
//! calcql eval "size(ids) * 2" --env '{"ids": [1, 2]}'
//! ```

use calcql_core::DiagnosticBag;
use calcql_expr::{Calculator, Environment, ExpressionEngine, Program};
use calcql_runtime::{
    Engine, ExecuteError, ExecutorConfig, FetchFuture, FetchRequest, FetchResult, Fetcher,
    FetcherMap, PropertyFetcher, TaskGraph,
};
use calcql_semantic::{check, DirectiveRegistry, Operation};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "calcql")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate query files
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Validate a query and print its task graph
    Plan {
        file: PathBuf,
    },

    /// Execute a query against canned data
    Run {
        file: PathBuf,

        /// Values served by query path, or by `Type.field`
        #[arg(long)]
        data: Option<PathBuf>,

        /// Executor configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Variable values (JSON object)
        #[arg(long)]
        variables: Option<PathBuf>,
    },

    /// Evaluate a directive expression
    Eval {
        expression: String,

        /// Variables (inline JSON object)
        #[arg(long)]
        env: Option<String>,
    },

    /// Print version information
    Version,
}

pub async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Check { files } => check_files(&files, cli.verbose),
        Commands::Plan { file } => plan_file(&file),
        Commands::Run {
            file,
            data,
            config,
            variables,
        } => run_file(&file, data.as_deref(), config.as_deref(), variables.as_deref()).await,
        Commands::Eval { expression, env } => eval_expression(&expression, env.as_deref()),
        Commands::Version => {
            println!("calcql {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Reads a query document.
pub fn load_operation(path: &Path) -> Result<Operation, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    let operation = serde_json::from_str(&source)
        .map_err(|e| format!("{}: not a valid query: {e}", path.display()))?;
    Ok(operation)
}

fn load_json(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&source)
        .map_err(|e| format!("{}: invalid JSON: {e}", path.display()))?)
}

fn print_diagnostics(file: &Path, diagnostics: &DiagnosticBag) {
    eprintln!("{} {}", "Error".red().bold(), file.display());
    for error in diagnostics.errors() {
        eprintln!("  {} [{}] {}", "-->".blue(), error.code, error.title);
        if let Some(path) = &error.location_path {
            eprintln!("      at {}", path.as_str().cyan());
        }
        if let Some(msg) = &error.message {
            eprintln!("      {msg}");
        }
        for label in &error.labels {
            eprintln!(
                "      {} {}..{}: {}",
                "^".red(),
                label.span.start,
                label.span.end,
                label.message
            );
        }
    }
}

fn print_warnings(file: &Path, diagnostics: &DiagnosticBag) {
    for warning in diagnostics.warnings() {
        eprintln!(
            "{} {} [{}] {}",
            "Warning".yellow().bold(),
            file.display(),
            warning.code,
            warning.message.as_deref().unwrap_or(&warning.title)
        );
    }
}

fn check_files(files: &[PathBuf], verbose: bool) -> Result<i32, Box<dyn std::error::Error>> {
    let registry = DirectiveRegistry::builtin();
    let engine = Calculator::new();
    let mut has_errors = false;

    for file in files {
        if verbose {
            println!("{} {}", "Checking".blue(), file.display());
        }

        let operation = load_operation(file)?;
        let result = check(&operation, &registry, &engine);
        print_warnings(file, &result.diagnostics);

        if result.is_ok() {
            if verbose {
                println!("{} {}", "OK".green(), file.display());
            }
        } else {
            has_errors = true;
            print_diagnostics(file, &result.diagnostics);
        }
    }

    if has_errors {
        Ok(1)
    } else {
        println!(
            "{} {} file(s) checked",
            "Success:".green().bold(),
            files.len()
        );
        Ok(0)
    }
}

fn plan_file(file: &Path) -> Result<i32, Box<dyn std::error::Error>> {
    let operation = load_operation(file)?;
    let registry = DirectiveRegistry::builtin();
    let result = check(&operation, &registry, &Calculator::new());
    print_warnings(file, &result.diagnostics);
    if !result.is_ok() {
        print_diagnostics(file, &result.diagnostics);
        return Ok(1);
    }

    let graph = TaskGraph::build_with(&operation, &registry);
    println!("{} {} task(s)", "Plan:".green().bold(), graph.len());
    print!("{}", graph.render());
    Ok(0)
}

/// Serves canned values: first by query path, then by `Type.field`, then
/// from the parent object.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    values: Map<String, Value>,
}

impl FixtureFetcher {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    fn lookup(&self, request: &FetchRequest) -> Option<Value> {
        self.values
            .get(&request.path)
            .or_else(|| self.values.get(&request.key()))
            .cloned()
    }
}

impl Fetcher for FixtureFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        match self.lookup(&request) {
            Some(value) => {
                debug!(path = %request.path, "serving fixture");
                let result: FetchResult = Ok(value);
                Box::pin(async move { result })
            }
            None => PropertyFetcher.fetch(request),
        }
    }
}

async fn run_file(
    file: &Path,
    data: Option<&Path>,
    config: Option<&Path>,
    variables: Option<&Path>,
) -> Result<i32, Box<dyn std::error::Error>> {
    let operation = load_operation(file)?;

    let config = match config {
        Some(path) => ExecutorConfig::from_json(&std::fs::read_to_string(path)?)
            .map_err(|e| format!("{}: invalid config: {e}", path.display()))?,
        None => ExecutorConfig::default(),
    };
    let fixtures = match data.map(load_json).transpose()? {
        Some(Value::Object(values)) => values,
        Some(_) => return Err("fixtures must be a JSON object".into()),
        None => Map::new(),
    };
    let variables = match variables.map(load_json).transpose()? {
        Some(Value::Object(values)) => values,
        Some(_) => return Err("variables must be a JSON object".into()),
        None => Map::new(),
    };

    let mut fetchers = FetcherMap::new();
    fetchers.set_default(FixtureFetcher::new(fixtures));
    let engine = Engine::with_config(fetchers, config);

    match engine.execute(&operation, &variables).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(i32::from(response.has_errors()))
        }
        Err(ExecuteError::Validation(diagnostics)) => {
            print_diagnostics(file, &diagnostics);
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

fn eval_expression(expression: &str, env: Option<&str>) -> Result<i32, Box<dyn std::error::Error>> {
    if let Err(err) = Program::compile(expression) {
        eprintln!("{:?}", miette::Report::new(err));
        return Ok(1);
    }

    let env: Environment = match env {
        Some(source) => {
            let mut env = Environment::new();
            env.extend_from_object(&serde_json::from_str(source)?);
            env
        }
        None => Environment::new(),
    };

    match Calculator::new().evaluate(expression, &env) {
        Ok(value) => {
            println!("{value}");
            Ok(0)
        }
        Err(err) => {
            eprintln!("{} {err}", "Error:".red().bold());
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parse() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from(["calcql", "run", "q.json", "--data", "f.json"]);
        let Commands::Run { file, data, config, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(file, PathBuf::from("q.json"));
        assert_eq!(data, Some(PathBuf::from("f.json")));
        assert!(config.is_none());
    }

    #[tokio::test]
    async fn test_fixture_fetcher() {
        let fetcher = FixtureFetcher::new(
            json!({"userInfo#ids": [1, 2], "Query.version": "1.0"})
                .as_object()
                .cloned()
                .unwrap(),
        );

        let mut by_path = FetchRequest::new("ids", "User");
        by_path.path = "userInfo#ids".to_string();
        assert_eq!(fetcher.fetch(by_path).await.unwrap(), json!([1, 2]));

        let by_field = FetchRequest::new("version", "Query");
        assert_eq!(fetcher.fetch(by_field).await.unwrap(), json!("1.0"));

        let fallback = FetchRequest::new("name", "User").with_parent(json!({"name": "Ann"}));
        assert_eq!(fetcher.fetch(fallback).await.unwrap(), json!("Ann"));
    }

    #[tokio::test]
    async fn test_demo_query() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        let operation = load_operation(&demos.join("item_ids.json")).unwrap();
        let Value::Object(fixtures) = load_json(&demos.join("fixtures.json")).unwrap() else {
            panic!("fixtures must be an object");
        };

        let mut fetchers = FetcherMap::new();
        fetchers.set_default(FixtureFetcher::new(fixtures));
        let engine = Engine::new(fetchers);
        let variables = json!({"minPrice": 50}).as_object().cloned().unwrap();

        let response = engine.execute(&operation, &variables).await.unwrap();
        assert!(!response.has_errors(), "{:?}", response.errors);
        assert_eq!(
            response.get(&["itemList"]),
            Some(&json!([{"id": 1, "price": 120}, {"id": 3, "price": 75}]))
        );
        assert_eq!(response.get(&["userInfo", "name"]), Some(&json!("Alice")));
    }
}
