use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use token_fanout::app::{
    BalanceAuditor, EventSink, PipelineState, PipelineStep, RunSummary, TracingSink,
    WorkerOrchestrator,
};
use token_fanout::config::{ConcurrencyMode, Settings, DEFAULT_CONFIG_PATH};
use token_fanout::wallet::units::from_base_units;
use token_fanout::wallet::{
    Account, AccountStore, LedgerClient, RpcLedgerClient, TransactionDispatcher, WalletKeypair,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Fan a token amount out through generated accounts")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Seal generated credentials with this password
    #[arg(long, env = "FANOUT_STORE_PASSWORD", hide_env_values = true, global = true)]
    store_password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a default config file with a fresh funding key
    Init,

    /// Generate accounts and run the seed, gas and forward transfers for each
    Send {
        /// Ledger JSON-RPC endpoint
        #[arg(long)]
        rpc_url: Option<String>,

        /// Number of accounts to generate
        #[arg(short = 'n', long)]
        count: Option<usize>,

        #[arg(long, value_enum)]
        mode: Option<ConcurrencyMode>,

        /// base58 funding keypair, overrides the config file
        #[arg(long, env = "FANOUT_FUNDING_KEY", hide_env_values = true)]
        funding_key: Option<String>,

        /// Skip the funding balance check
        #[arg(long)]
        skip_preflight: bool,

        /// Run over the accounts already in the store instead of generating new ones
        #[arg(long)]
        reuse_accounts: bool,
    },

    /// Show native and token balances of every generated account
    Balances {
        #[arg(long)]
        rpc_url: Option<String>,
    },

    /// Show the funding account address (useful for funding)
    Address {
        #[arg(long, env = "FANOUT_FUNDING_KEY", hide_env_values = true)]
        funding_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init => init(&cli.config),
        Command::Send {
            rpc_url,
            count,
            mode,
            funding_key,
            skip_preflight,
            reuse_accounts,
        } => {
            let mut settings = Settings::load(&cli.config)?;
            if let Some(rpc_url) = rpc_url {
                settings.rpc_url = rpc_url;
            }
            if let Some(count) = count {
                settings.account_count = count;
            }
            if let Some(mode) = mode {
                settings.mode = mode;
            }
            if skip_preflight {
                settings.preflight = false;
            }

            let all_succeeded = send(
                &settings,
                funding_key.as_deref(),
                cli.store_password,
                reuse_accounts,
            )
            .await?;
            if !all_succeeded {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Balances { rpc_url } => {
            let mut settings = Settings::load(&cli.config)?;
            if let Some(rpc_url) = rpc_url {
                settings.rpc_url = rpc_url;
            }
            balances(&settings, cli.store_password).await
        }
        Command::Address { funding_key } => {
            let settings = Settings::load(&cli.config)?;
            let funding = settings.funding_keypair(funding_key.as_deref())?;
            println!("Funding account: {}", funding.pubkey());
            println!("Please fund this account before running transfers");
            Ok(())
        }
    }
}

fn init(path: &Path) -> Result<()> {
    let funding = WalletKeypair::new();
    let settings = Settings {
        funding_key: Some(funding.to_base58_string()),
        ..Settings::default()
    };
    settings.save(path)?;

    println!("Default config generated at: {}", path.display());
    println!("Funding account: {}", funding.pubkey());
    println!("Set destination and token_contract, then fund this account before running transfers");
    Ok(())
}

fn open_store(settings: &Settings, password: Option<String>) -> Result<AccountStore> {
    let store = AccountStore::new(&settings.accounts_dir)?;
    Ok(match password {
        Some(password) => store.with_password(password),
        None => store,
    })
}

fn connect(settings: &Settings) -> Result<Arc<dyn LedgerClient>> {
    let client = RpcLedgerClient::new(settings.rpc_url.clone(), settings.request_timeout())?;
    info!(endpoint = client.endpoint(), "Using ledger endpoint");
    Ok(Arc::new(client))
}

async fn send(
    settings: &Settings,
    funding_key: Option<&str>,
    password: Option<String>,
    reuse_accounts: bool,
) -> Result<bool> {
    settings.validate()?;

    let funding = Account::from_keypair(settings.funding_keypair(funding_key)?);
    let ledger = connect(settings)?;
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);
    let dispatcher =
        TransactionDispatcher::new(ledger.clone(), settings.dispatch_policy()?, events.clone());
    let orchestrator = WorkerOrchestrator::new(
        ledger,
        dispatcher,
        funding,
        settings.transfer_plan()?,
        events,
    );

    let store = open_store(settings, password)?;
    let existing = if reuse_accounts {
        let accounts = store.load_accounts()?;
        if accounts.is_empty() {
            bail!("No usable accounts in {}", store.path().display());
        }
        Some(accounts)
    } else {
        None
    };
    let count = existing.as_ref().map_or(settings.account_count, Vec::len);

    println!(
        "Sending {} transfers via {} to {}",
        count, settings.rpc_url, settings.destination
    );
    println!("Funding account: {}", orchestrator.funding_address());

    if settings.preflight {
        orchestrator.preflight(count).await?;
    }

    let accounts = match existing {
        Some(accounts) => accounts,
        None => store.create_accounts(count)?,
    };
    let summary = orchestrator.run(accounts).await;

    print_summary(&summary, settings)?;
    Ok(summary.failed() == 0)
}

fn print_summary(summary: &RunSummary, settings: &Settings) -> Result<()> {
    println!();
    for report in &summary.reports {
        match &report.state {
            PipelineState::ForwardConfirmed => {
                let handle = report
                    .record(PipelineStep::Forward)
                    .map(|record| record.handle.to_string())
                    .unwrap_or_default();
                println!("#{} {}: forwarded ({})", report.index, report.account, handle);
            }
            state => println!("#{} {}: {}", report.index, report.account, state),
        }
    }

    println!();
    println!("Run: {}", summary.run_id);
    println!(
        "Pipelines: {} succeeded, {} failed, {} confirmed transfers",
        summary.succeeded(),
        summary.failed(),
        summary.confirmed_dispatches()
    );
    println!(
        "Token distributed: {}",
        from_base_units(summary.token_distributed(), settings.token_decimals)?
    );
    println!(
        "Native distributed: {}",
        from_base_units(summary.native_distributed(), settings.native_decimals)?
    );
    println!(
        "Token forwarded: {}",
        from_base_units(summary.token_forwarded(), settings.token_decimals)?
    );
    println!("Time taken: {:.2} seconds", summary.elapsed.as_secs_f64());
    Ok(())
}

async fn balances(settings: &Settings, password: Option<String>) -> Result<()> {
    let auditor = BalanceAuditor::new(
        connect(settings)?,
        settings.token_asset()?,
        settings.token_decimals,
        settings.native_decimals,
    );
    let store = open_store(settings, password)?;
    let report = auditor.audit(&store).await?;

    for balance in &report.balances {
        println!(
            "{} - native: {}, token: {}",
            balance.address, balance.native, balance.token
        );
    }
    if report.skipped > 0 {
        println!("Skipped {} unreadable account files", report.skipped);
    }
    println!();
    println!("Total native: {}", report.total_native);
    println!("Total token: {}", report.total_token);
    Ok(())
}
