//! # HAVEN Operator CLI
//!
//! Runs economy operations against a file-backed state directory.
//!
//! ```text
//! haven --pool data/pool.txt --state state open alice@example.com
//! haven --pool data/pool.txt --state state pull alice@example.com rare
//! haven --pool data/pool.txt --state state tokens admin@haven.local BONUS 10 200 --csv out.csv
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use haven_economy::{tokens_to_csv, AccountId, FileSource, FileStore, Haven, HavenConfig, HistoryEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Economy config (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Pool source file, one `identifier<delim>secret` record per line.
    #[arg(short, long)]
    pool: PathBuf,

    /// State directory for accounts, pool consumption, and tokens.
    #[arg(short, long, default_value = "state")]
    state: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in, creating the account on first use.
    Open { account: String },
    /// Show an account's balance.
    Balance { account: String },
    /// List gacha tiers.
    Tiers,
    /// Pay for a tier and draw its records.
    Pull { account: String, tier: String },
    /// Claim today's streak reward.
    Streak { account: String },
    /// List quests, or complete one.
    Quest { account: String, id: Option<String> },
    /// Redeem a token.
    Redeem { account: String, code: String },
    /// Show the account's referral code.
    ReferralCode { account: String },
    /// Redeem someone else's referral code.
    Referral { account: String, code: String },
    /// Show recent activity.
    History { account: String },
    /// Issue tokens (admin).
    Tokens {
        admin: String,
        prefix: String,
        count: u32,
        value: u64,
        /// Also write `token,value` CSV here.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Dashboard statistics (admin).
    Stats { admin: String },
    /// Print the purchase link for a coin package.
    Buy { account: String, package: String },
}

fn account(id: &str) -> anyhow::Result<AccountId> {
    AccountId::new(id).with_context(|| format!("invalid account id {id:?}"))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match &args.config {
        Some(path) => HavenConfig::from_toml_file(path).context("failed to load config")?,
        None => HavenConfig::default(),
    };
    let store = Arc::new(FileStore::open(&args.state).context("failed to open state directory")?);
    let (haven, report) = Haven::builder(config)
        .store(store)
        .open(&FileSource::new(&args.pool))
        .context("failed to open economy")?;
    info!(
        loaded = report.loaded,
        skipped = report.skipped.len(),
        consumed = report.restored_consumed,
        "pool ready"
    );

    run(&haven, args.command)
}

fn run(haven: &Haven, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Open { account: id } => {
            let opened = haven.open_account(&account(&id)?)?;
            println!("{} balance={} admin={}", opened.id, opened.balance, opened.is_admin);
        }
        Command::Balance { account: id } => {
            println!("{}", haven.balance(&account(&id)?)?);
        }
        Command::Tiers => {
            for tier in haven.tiers() {
                println!(
                    "{:<10} {:>5} coins  {:>2} records  {}.{:02}%",
                    tier.name,
                    tier.price,
                    tier.records_per_pull,
                    tier.chance_bp / 100,
                    tier.chance_bp % 100
                );
            }
        }
        Command::Pull { account: id, tier } => {
            let pull = haven.pull_gacha(&account(&id)?, &tier)?;
            for record in &pull.records {
                println!("#{} {} {}", record.index, record.identifier, record.secret);
            }
            println!("paid {} for {}, balance {}", pull.cost, pull.tier, pull.balance);
        }
        Command::Streak { account: id } => {
            let claim = haven.claim_streak(&account(&id)?)?;
            println!("+{} ({}), balance {}", claim.amount, claim.key, claim.balance);
        }
        Command::Quest { account: id, id: None } => {
            for status in haven.quests(&account(&id)?)? {
                let mark = if status.completed { "x" } else { " " };
                println!("[{mark}] {} {} (+{})", status.quest.id, status.quest.title, status.quest.reward);
            }
        }
        Command::Quest { account: id, id: Some(quest) } => {
            let claim = haven.complete_quest(&account(&id)?, &quest)?;
            println!("+{} ({}), balance {}", claim.amount, claim.key, claim.balance);
        }
        Command::Redeem { account: id, code } => {
            let claim = haven.redeem_token(&account(&id)?, &code)?;
            println!("+{} ({}), balance {}", claim.amount, claim.key, claim.balance);
        }
        Command::ReferralCode { account: id } => {
            println!("{}", haven.referral_code(&account(&id)?)?);
        }
        Command::Referral { account: id, code } => {
            let claim = haven.redeem_referral(&account(&id)?, &code)?;
            println!("+{} ({}), balance {}", claim.amount, claim.key, claim.balance);
        }
        Command::History { account: id } => {
            for entry in haven.history(&account(&id)?)? {
                match entry.event {
                    HistoryEvent::Allocation(batch) => {
                        println!("{} pull {} -{} ({} records)", entry.at, batch.tier, batch.cost, batch.records.len());
                    }
                    HistoryEvent::TokenRedeemed { code, amount } => {
                        println!("{} token {code} +{amount}", entry.at);
                    }
                }
            }
        }
        Command::Tokens { admin, prefix, count, value, csv } => {
            let tokens = haven.generate_tokens(&account(&admin)?, &prefix, count, value)?;
            for token in &tokens {
                println!("{} {}", token.code, token.value);
            }
            if let Some(path) = csv {
                std::fs::write(&path, tokens_to_csv(&tokens))
                    .with_context(|| format!("failed to write {}", path.display()))?;
            }
        }
        Command::Stats { admin } => {
            let stats = haven.stats(&account(&admin)?)?;
            println!("accounts opened   {}", stats.accounts_opened);
            println!("pulls             {}", stats.pulls);
            println!("coins spent       {}", stats.coins_spent);
            println!("grants paid       {}", stats.grants_paid);
            println!("records           {}/{}", stats.records_available, stats.records_total);
            println!("tokens issued     {}", stats.tokens_issued);
            println!("tokens redeemed   {}", stats.tokens_redeemed);
        }
        Command::Buy { account: id, package } => {
            let handoff = haven.purchase_handoff(&account(&id)?, &package)?;
            println!("{}", handoff.url);
        }
    }
    Ok(())
}
