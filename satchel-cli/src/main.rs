use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use satchel_core::{Client, CollectionStore, Database, FindOptions};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "Satchel shell - interactive client for Satchel collections")]
#[command(version)]
struct Cli {
    /// Connect on startup: "memory" or "s3://bucket[/prefix]"
    #[arg(long)]
    connect: Option<String>,

    /// Database name (defaults to the client's default database)
    #[arg(long)]
    db: Option<String>,

    /// Start with debug logging enabled
    #[arg(long)]
    debug: bool,
}

type DebugHandle = reload::Handle<LevelFilter, tracing_subscriber::registry::Registry>;

fn init_logging(debug: bool) -> DebugHandle {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let (filter, handle) = reload::Layer::new(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

/// Replace extended-JSON wrappers so id-like literals round-trip:
/// `{"$oid": "..."}` becomes the plain id string.
fn normalize_extended_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(oid)) = map.get("$oid") {
                    return Value::String(oid.clone());
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_extended_json(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items.into_iter().map(normalize_extended_json).collect(),
        ),
        other => other,
    }
}

/// Parse whitespace-separated JSON values from the command tail
fn parse_json_args(input: &str) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    for item in serde_json::Deserializer::from_str(input).into_iter::<Value>() {
        let value = item.context("invalid JSON argument")?;
        values.push(normalize_extended_json(value));
    }
    Ok(values)
}

fn print_value(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Shell {
    debug_handle: DebugHandle,
    db_name: Option<String>,
    client: Option<Client>,
    database: Option<Arc<Database>>,
    collection: Option<(String, Arc<dyn CollectionStore>)>,
}

impl Shell {
    fn new(debug_handle: DebugHandle, db_name: Option<String>) -> Self {
        Shell {
            debug_handle,
            db_name,
            client: None,
            database: None,
            collection: None,
        }
    }

    fn prompt(&self) -> String {
        match &self.collection {
            Some((name, _)) => format!("satchel {}> ", name),
            None => "satchel> ".to_string(),
        }
    }

    async fn connect(&mut self, spec: &str) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await.ok();
        }
        self.database = None;
        self.collection = None;

        let client = Client::connect(spec)
            .await
            .with_context(|| format!("failed to connect to '{}'", spec))?;
        self.database = Some(client.db(self.db_name.as_deref())?);
        self.client = Some(client);
        println!("connected to {}", spec);
        Ok(())
    }

    async fn use_collection(&mut self, name: &str) -> Result<()> {
        let database = self
            .database
            .as_ref()
            .ok_or_else(|| anyhow!("not connected; run: connect <type>"))?;
        let collection = database
            .collection(name)
            .await
            .with_context(|| format!("failed to open collection '{}'", name))?;
        self.collection = Some((name.to_string(), collection));
        println!("using collection {}", name);
        Ok(())
    }

    fn current_collection(&self) -> Result<&Arc<dyn CollectionStore>> {
        self.collection
            .as_ref()
            .map(|(_, coll)| coll)
            .ok_or_else(|| anyhow!("no collection selected; run: use <collection>"))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await?;
            println!("closed");
        }
        self.database = None;
        self.collection = None;
        Ok(())
    }

    fn set_debug(&self, enabled: bool) -> Result<()> {
        let level = if enabled {
            LevelFilter::DEBUG
        } else {
            LevelFilter::WARN
        };
        self.debug_handle
            .modify(|filter| *filter = level)
            .context("failed to change log level")?;
        println!("debug {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    async fn dispatch(&mut self, line: &str) -> Result<Flow> {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "exit" | "quit" => {
                self.close().await.ok();
                return Ok(Flow::Exit);
            }
            "help" => print_help(),
            "connect" => {
                if rest.is_empty() {
                    bail!("usage: connect <memory|s3://bucket[/prefix]>");
                }
                self.connect(rest).await?;
            }
            "use" => {
                if rest.is_empty() {
                    bail!("usage: use <collection>");
                }
                self.use_collection(rest).await?;
            }
            "close" => self.close().await?,
            "debug" => match rest {
                "on" => self.set_debug(true)?,
                "off" => self.set_debug(false)?,
                _ => bail!("usage: debug on|off"),
            },
            method => self.run_method(method, rest).await?,
        }
        Ok(Flow::Continue)
    }

    async fn run_method(&mut self, method: &str, rest: &str) -> Result<()> {
        let collection = self.current_collection()?.clone();

        // Commands whose first argument is a bare word, not JSON
        match method {
            "dropIndex" => {
                let name = rest.trim().trim_matches('"');
                if name.is_empty() {
                    bail!("usage: dropIndex <name>");
                }
                collection.drop_index(name).await?;
                println!("dropped {}", name);
                return Ok(());
            }
            "distinct" => {
                let (field, remainder) = match rest.split_once(char::is_whitespace) {
                    Some((field, remainder)) => (field, remainder.trim()),
                    None => (rest, ""),
                };
                let field = field.trim_matches('"');
                if field.is_empty() {
                    bail!("usage: distinct <field> [filter]");
                }
                let filter = parse_json_args(remainder)?
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| serde_json::json!({}));
                let values = collection.distinct(field, &filter).await?;
                print_value(&Value::Array(values));
                return Ok(());
            }
            _ => {}
        }

        let mut args = parse_json_args(rest)?;
        let mut next_arg = || {
            if args.is_empty() {
                None
            } else {
                Some(args.remove(0))
            }
        };

        match method {
            "insertOne" => {
                let doc = next_arg().ok_or_else(|| anyhow!("usage: insertOne <document>"))?;
                let result = collection.insert_one(doc).await?;
                print_value(&serde_json::to_value(&result)?);
            }
            "insertMany" => {
                let docs = next_arg()
                    .and_then(|v| v.as_array().cloned())
                    .ok_or_else(|| anyhow!("usage: insertMany <[documents]>"))?;
                let result = collection.insert_many(docs).await?;
                print_value(&serde_json::to_value(&result)?);
            }
            "replaceOne" => {
                let filter =
                    next_arg().ok_or_else(|| anyhow!("usage: replaceOne <filter> <document>"))?;
                let doc =
                    next_arg().ok_or_else(|| anyhow!("usage: replaceOne <filter> <document>"))?;
                let result = collection.replace_one(&filter, doc).await?;
                print_value(&serde_json::to_value(&result)?);
            }
            "updateOne" => {
                let filter =
                    next_arg().ok_or_else(|| anyhow!("usage: updateOne <filter> <update>"))?;
                let update =
                    next_arg().ok_or_else(|| anyhow!("usage: updateOne <filter> <update>"))?;
                let result = collection.update_one(&filter, &update).await?;
                print_value(&serde_json::to_value(&result)?);
            }
            "deleteOne" => {
                let filter = next_arg().ok_or_else(|| anyhow!("usage: deleteOne <filter>"))?;
                let result = collection.delete_one(&filter).await?;
                print_value(&serde_json::to_value(&result)?);
            }
            "deleteMany" => {
                let filter = next_arg().ok_or_else(|| anyhow!("usage: deleteMany <filter>"))?;
                let result = collection.delete_many(&filter).await?;
                print_value(&serde_json::to_value(&result)?);
            }
            "find" => {
                let filter = next_arg().unwrap_or_else(|| serde_json::json!({}));
                let options = match next_arg() {
                    Some(value) => FindOptions::from_json(&value)?,
                    None => FindOptions::new(),
                };
                let docs = collection.find(&filter, options).await?.to_array().await?;
                let values: Vec<Value> = docs.iter().map(|d| d.to_value()).collect();
                print_value(&Value::Array(values));
                println!("{} document(s)", docs.len());
            }
            "findOne" => {
                let filter = next_arg().unwrap_or_else(|| serde_json::json!({}));
                let options = match next_arg() {
                    Some(value) => FindOptions::from_json(&value)?,
                    None => FindOptions::new(),
                };
                match collection.find_one(&filter, options).await? {
                    Some(doc) => print_value(&doc.to_value()),
                    None => println!("null"),
                }
            }
            "countDocuments" => {
                let filter = next_arg().unwrap_or_else(|| serde_json::json!({}));
                println!("{}", collection.count_documents(&filter).await?);
            }
            "explain" => {
                let filter = next_arg().unwrap_or_else(|| serde_json::json!({}));
                let options = match next_arg() {
                    Some(value) => FindOptions::from_json(&value)?,
                    None => FindOptions::new(),
                };
                let plan = collection.explain(&filter, options).await?;
                print_value(&plan);
            }
            "createIndex" => {
                let keys =
                    next_arg().ok_or_else(|| anyhow!("usage: createIndex <keys> [options]"))?;
                let opts = next_arg();
                let name = collection.create_index(&keys, opts.as_ref()).await?;
                println!("{}", name);
            }
            "listIndexes" => {
                let listed = collection.list_indexes().await?;
                print_value(&Value::Array(listed));
            }
            "flush" => {
                collection.flush().await?;
                println!("flushed");
            }
            other => bail!("unknown command: {} (try: help)", other),
        }
        Ok(())
    }
}

fn print_help() {
    println!(
        "commands:
  connect <type>          connect to a repository: memory | s3://bucket[/prefix]
  use <collection>        select the working collection
  close                   close the current client
  debug on|off            toggle debug logging
  help                    this text
  exit | quit             leave the shell

collection methods (JSON arguments, whitespace separated):
  insertOne <doc>                       insertMany <[docs]>
  replaceOne <filter> <doc>             updateOne <filter> {{\"$set\": ...}}
  deleteOne <filter>                    deleteMany <filter>
  find [filter] [options]               findOne [filter] [options]
  countDocuments [filter]               distinct <field> [filter]
  explain [filter] [options]            createIndex <keys> [options]
  dropIndex <name>                      listIndexes
  flush

options: {{\"sort\": {{\"field\": 1|-1}}, \"limit\": n}}
ids: {{\"$oid\": \"...\"}} literals are accepted and round-trip"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let debug_handle = init_logging(cli.debug);

    let mut shell = Shell::new(debug_handle, cli.db.clone());
    if let Some(spec) = &cli.connect {
        shell.connect(spec).await?;
    }

    let mut editor = DefaultEditor::new().context("failed to start line editor")?;
    loop {
        match editor.readline(&shell.prompt()) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                editor.add_history_entry(line).ok();
                match shell.dispatch(line).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Exit) => break,
                    Err(err) => eprintln!("error: {:#}", err),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err).context("readline failed"),
        }
    }
    shell.close().await.ok();
    Ok(())
}
