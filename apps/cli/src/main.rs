use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use lucidselect_core_sdk::{
    adapter::ProviderRequestAdapter,
    config::AppConfig,
    db::SqliteStore,
    history, server,
    service::{CustomProviderInput, PromptInput, QueryService},
    store::SettingsStore,
    telemetry,
    transport::ReqwestTransport,
};

/**
 * \brief CLI 程序入口：对选中文本执行提示词，并管理 Provider 设置。
 */
#[derive(Parser, Debug)]
#[command(name = "lucidselect", version, about = "LucidSelect: ask an LLM about selected text")]
struct Cli {
    /** \brief 设置数据库路径（默认读取 LUCIDSELECT_DB） */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /** \brief 开启文件日志（logs/lucidselect.log），并保存该开关 */
    #[arg(long, global = true, default_value_t = false)]
    enable_telemetry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 发送一次查询。未提供 --text 时从标准输入读取选中文本。
     */
    Query {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, conflicts_with = "action")]
        prompt: Option<String>,
        /** \brief 提示词 ID：内置的 answer_question / paraphrase / summarize / analyze_qcm，或用户提示词 */
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        text: Option<String>,
    },

    /** \brief 列出全部 Provider 及凭证状态。 */
    Providers,

    /** \brief 管理 API Key。 */
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /** \brief 管理自定义 Provider。 */
    Custom {
        #[command(subcommand)]
        command: CustomCommands,
    },

    /** \brief 设置默认 Provider。 */
    Select { provider: String },

    /** \brief 历史记录。 */
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    /** \brief 管理提示词。 */
    Prompts {
        #[command(subcommand)]
        command: PromptCommands,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5174")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyCommands {
    Set { provider: String, api_key: String },
    Clear { provider: String },
}

#[derive(Subcommand, Debug)]
enum CustomCommands {
    /** \brief 从 JSON 文件新增或更新自定义 Provider（字段同 HTTP 接口）。 */
    Add { file: PathBuf },
    Remove { provider: String },
}

#[derive(Subcommand, Debug)]
enum PromptCommands {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        template: String,
    },
    /** \brief 更新用户提示词，未提供的字段保持不变。 */
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        template: Option<String>,
    },
    Remove { id: String },
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Search { term: String },
    Clear,
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExportFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("load configuration failed")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let store = Arc::new(SqliteStore::open(&config.db_path).context("open settings database failed")?);
    if cli.enable_telemetry {
        store
            .set_telemetry_enabled(true)
            .await
            .context("save telemetry failed")?;
    }
    let telemetry_read = store.telemetry_enabled().await;
    telemetry::init(*telemetry_read.as_ref().unwrap_or(&false))?;
    if let Err(e) = telemetry_read {
        warn!(error = %e, "read telemetry switch failed, file logging disabled");
    }

    let adapter = ProviderRequestAdapter::new(Arc::new(ReqwestTransport::new()), &config.adapter);
    let service = QueryService::new(store.clone(), adapter);

    match cli.command {
        Commands::Query {
            provider,
            prompt,
            action,
            text,
        } => {
            let instruction = match (prompt, action) {
                (Some(p), _) => p,
                (None, Some(a)) => service
                    .find_prompt(&a)
                    .await?
                    .map(|p| p.template)
                    .with_context(|| format!("unknown action: {}", a))?,
                (None, None) => bail!("either --prompt or --action is required"),
            };
            let selected = match text {
                Some(t) => t,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("read selected text from stdin failed")?;
                    buf
                }
            };
            if selected.trim().is_empty() {
                bail!("selected text is empty");
            }

            let outcome = service
                .query(provider.as_deref(), &instruction, selected.trim())
                .await;
            match (outcome.answer, outcome.error) {
                (Some(answer), _) => println!("{}", answer),
                (None, Some(error)) => bail!(error),
                (None, None) => bail!("empty outcome"),
            }
        }
        Commands::Providers => {
            for p in service.list_providers().await? {
                println!(
                    "{} {:<24} {:<12} key={} {}",
                    if p.selected { "*" } else { " " },
                    p.id,
                    p.name,
                    p.credential.unwrap_or("-"),
                    p.endpoint
                );
            }
        }
        Commands::Key { command } => match command {
            KeyCommands::Set { provider, api_key } => {
                service.set_credential(&provider, &api_key).await?;
            }
            KeyCommands::Clear { provider } => {
                service.clear_credential(&provider).await?;
            }
        },
        Commands::Custom { command } => match command {
            CustomCommands::Add { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("read {} failed", file.display()))?;
                let input: CustomProviderInput =
                    serde_json::from_str(&raw).context("parse custom provider failed")?;
                let id = service.save_custom_provider(input).await?;
                println!("Saved custom provider id={}", id);
            }
            CustomCommands::Remove { provider } => {
                service.delete_provider(&provider).await?;
            }
        },
        Commands::Select { provider } => {
            service.select_provider(&provider).await?;
            info!(provider = %provider, "provider selected");
        }
        Commands::History { command } => {
            let entries = store.history().await.context("load history failed")?;
            match command {
                HistoryCommands::List { limit } => print_history(&entries[..entries.len().min(limit)]),
                HistoryCommands::Search { term } => print_history(&history::search(&entries, &term)),
                HistoryCommands::Clear => {
                    store.clear_history().await?;
                    info!("history cleared");
                }
                HistoryCommands::Export { format } => match format {
                    ExportFormat::Json => println!("{}", history::export_json(&entries)?),
                    ExportFormat::Csv => println!("{}", history::export_csv(&entries)),
                },
            }
        }
        Commands::Prompts { command } => match command {
            PromptCommands::List => {
                for p in service.list_prompts().await? {
                    println!(
                        "{} {:<24} {:<20} {}",
                        if p.builtin { " " } else { "+" },
                        p.id,
                        p.name,
                        p.template.replace('\n', " ")
                    );
                }
            }
            PromptCommands::Add { name, template } => {
                let id = service
                    .add_prompt(PromptInput {
                        name: Some(name),
                        template: Some(template),
                    })
                    .await?;
                println!("Saved prompt id={}", id);
            }
            PromptCommands::Update { id, name, template } => {
                service
                    .update_prompt(&id, PromptInput { name, template })
                    .await?;
            }
            PromptCommands::Remove { id } => {
                service.delete_prompt(&id).await?;
            }
        },
        Commands::Serve { addr } => {
            info!(addr = %addr, db = %config.db_path.display(), "starting local API");
            server::run(&addr, service).await?;
        }
    }

    Ok(())
}

fn print_history(entries: &[lucidselect_core_sdk::models::HistoryEntry]) {
    for e in entries {
        println!("[{}] {} | {}", e.timestamp, e.provider_id, e.prompt);
        println!("  > {}", e.query.replace('\n', " "));
        println!("  < {}", e.response.replace('\n', " "));
    }
}
