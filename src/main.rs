use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledger_lens::db::init_pool;
use ledger_lens::llm::ConversationHistory;
use ledger_lens::schema::{describe_columns, introspect};
use ledger_lens::{AppConfig, AskRequest, BusinessId, Pipeline};
use std::io::{self, BufRead, Write};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ledger-lens")]
#[command(about = "Answer natural-language questions about a business's transactions")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question
    Ask {
        #[arg(short, long)]
        business_id: String,

        question: String,
    },

    /// Print the resolved SQL for a question without running it
    Resolve {
        #[arg(short, long)]
        business_id: String,

        question: String,
    },

    /// Interactive session; earlier turns are sent as context
    Chat {
        #[arg(short, long)]
        business_id: String,
    },

    /// Describe table columns from the database
    Schema {
        #[arg(short, long = "table", default_value = "transactions")]
        tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    match args.command {
        Command::Ask { business_id, question } => {
            let business_id = BusinessId::parse(&business_id)?;
            let pipeline = Pipeline::from_config(&config, true).await?;
            let answer = pipeline.respond(&AskRequest::new(business_id, question)).await;
            println!("{}", answer);
        }
        Command::Resolve { business_id, question } => {
            let business_id = BusinessId::parse(&business_id)?;
            let pipeline = Pipeline::from_config(&config, false).await?;
            let resolved = pipeline.resolve_only(&AskRequest::new(business_id, question)).await?;
            println!("{}", resolved.sql);
            for param in resolved.describe_params() {
                println!("  {}", param);
            }
        }
        Command::Chat { business_id } => {
            let business_id = BusinessId::parse(&business_id)?;
            let pipeline = Pipeline::from_config(&config, true).await?;
            chat(&pipeline, business_id, config.history_messages).await?;
        }
        Command::Schema { tables } => {
            let pool = init_pool(config.require_database_url()?, config.execution.timeout).await?;
            let columns = introspect(&pool, &tables).await?;
            if columns.is_empty() {
                anyhow::bail!("no columns found for tables: {}", tables.join(", "));
            }
            println!("{}", describe_columns(&columns));
        }
    }
    Ok(())
}

async fn chat(pipeline: &Pipeline, business_id: BusinessId, history_messages: usize) -> Result<()> {
    let mut history = ConversationHistory::new(history_messages);
    let stdin = io::stdin();
    info!("Chat session for business {} (empty line or 'exit' to quit)", business_id);

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() || question.eq_ignore_ascii_case("exit") {
            break;
        }

        let request = AskRequest::new(business_id.clone(), question).with_history(history.clone());
        let answer = pipeline.respond(&request).await;
        println!("{}\n", answer);
        history.push_turn(question, &answer);
    }
    Ok(())
}
