//! tally - operator CLI for the identity and credit ledger engine.
//!
//! Opens the configured store and drives the engine directly: bootstrap
//! organizations and applications, resolve identities, move credits, issue
//! and redeem referral claims and invitation codes, charge actions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tally_core::config::EngineConfig;
use tally_core::engine::{Engine, ProfileAction, ProfileGrantOutcome};
use tally_core::identity::{ServerContext, SignalBag};
use tally_core::invitation::RedemptionOutcome;
use tally_core::policy::AppPolicy;
use tally_core::referral::ClaimOutcome;
use tracing_subscriber::EnvFilter;

/// tally - identity resolution and credit ledger engine
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the engine configuration file
    #[arg(short, long, default_value = "tally.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration file with a fresh token secret
    Init,

    /// Organization management
    #[command(subcommand)]
    Org(OrgCommands),

    /// Application management
    #[command(subcommand)]
    App(AppCommands),

    /// Resolve request signals to an identity
    Resolve {
        /// Application id
        #[arg(long)]
        app: i64,

        #[command(flatten)]
        signals: SignalArgs,
    },

    /// Show an identity's balance
    Balance {
        /// Identity id
        identity: i64,

        /// Pool the balance across the identity's shared account
        #[arg(long)]
        consolidated: bool,
    },

    /// Apply a manual credit adjustment (positive grants, negative debits)
    Adjust {
        /// Identity id
        identity: i64,

        /// Signed credit delta
        #[arg(allow_hyphen_values = true)]
        delta: i64,

        /// Note recorded in the entry metadata
        #[arg(long)]
        note: Option<String>,
    },

    /// List an identity's ledger entries
    Entries {
        /// Identity id
        identity: i64,

        /// First entry id to return
        #[arg(long, default_value = "0")]
        cursor: i64,

        /// Maximum entries to return
        #[arg(short = 'n', long, default_value = "50")]
        limit: u32,
    },

    /// Show aggregate ledger statistics
    Stats,

    /// Referral claim operations
    #[command(subcommand)]
    Claim(ClaimCommands),

    /// Waitlist operations
    #[command(subcommand)]
    Waitlist(WaitlistCommands),

    /// Invitation code operations
    #[command(subcommand)]
    Invite(InviteCommands),

    /// Charge an identity for a named action
    Charge {
        /// Identity id
        identity: i64,

        /// Action name
        action: String,

        /// Client-supplied cost (honored only when the policy allows it)
        #[arg(long)]
        cost: Option<i64>,
    },

    /// Grant a one-time profile-completion bonus
    Profile {
        /// Identity id
        identity: i64,

        /// Which profile action completed
        #[arg(value_enum)]
        action: ProfileActionArg,
    },
}

#[derive(Subcommand, Debug)]
enum OrgCommands {
    /// Create an organization
    Create {
        /// Organization name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum AppCommands {
    /// Create an application under an organization
    Create {
        /// Owning organization id
        #[arg(long)]
        org: i64,

        /// Application name
        name: String,

        /// Enable shared-account consolidation for this application
        #[arg(long)]
        shared_accounts: bool,

        /// Policy document (JSON file); defaults apply when omitted
        #[arg(long)]
        policy_file: Option<PathBuf>,
    },

    /// Show an application and its policy
    Show {
        /// Application id
        app: i64,
    },

    /// Replace an application's policy document
    SetPolicy {
        /// Application id
        app: i64,

        /// Policy document (JSON file)
        #[arg(long)]
        policy_file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ClaimCommands {
    /// Issue a claim token for a referral code
    Issue {
        /// The referrer's referral code
        code: String,
    },

    /// Record a pre-claim referral link visit
    Visit {
        /// The claim token
        token: String,
    },

    /// Redeem a claim token for a referred identity
    Redeem {
        /// The claim token
        token: String,

        /// The referred identity id
        #[arg(long)]
        referred: i64,
    },
}

#[derive(Subcommand, Debug)]
enum WaitlistCommands {
    /// Join an application's waitlist
    Join {
        /// Application id
        #[arg(long)]
        app: i64,

        /// The joiner's email
        email: String,

        #[command(flatten)]
        signals: SignalArgs,
    },

    /// Show a waitlist entry
    Show {
        /// Waitlist entry id
        entry: i64,
    },
}

#[derive(Subcommand, Debug)]
enum InviteCommands {
    /// Generate an invitation code for a waitlist entry
    Generate {
        /// Waitlist entry id
        entry: i64,

        /// Days until the code expires
        #[arg(long, default_value = "7")]
        expiry_days: i64,

        /// Maximum redemptions
        #[arg(long, default_value = "1")]
        max_uses: i64,
    },

    /// Redeem an invitation code
    Redeem {
        /// The invitation code
        code: String,

        #[command(flatten)]
        signals: SignalArgs,
    },
}

/// Client signals and server context shared by resolution-driven commands.
#[derive(Args, Debug)]
struct SignalArgs {
    /// Primary device fingerprint
    #[arg(long)]
    primary: String,

    /// Canvas-render hash
    #[arg(long)]
    canvas: Option<String>,

    /// Browser-signature hash
    #[arg(long)]
    browser_sig: Option<String>,

    /// Observed client IP
    #[arg(long, default_value = "")]
    ip: String,

    /// User-Agent header
    #[arg(long)]
    user_agent: Option<String>,

    /// Accept-Language header
    #[arg(long)]
    accept_language: Option<String>,
}

impl SignalArgs {
    fn bag(&self) -> SignalBag {
        SignalBag {
            primary: self.primary.clone(),
            canvas: self.canvas.clone(),
            browser_sig: self.browser_sig.clone(),
        }
    }

    fn ctx(&self) -> ServerContext {
        ServerContext {
            client_ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            accept_language: self.accept_language.clone(),
            platform_hint: None,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProfileActionArg {
    NameClaim,
    EmailClaim,
    EmailVerify,
}

impl From<ProfileActionArg> for ProfileAction {
    fn from(arg: ProfileActionArg) -> Self {
        match arg {
            ProfileActionArg::NameClaim => Self::NameClaim,
            ProfileActionArg::EmailClaim => Self::EmailClaim,
            ProfileActionArg::EmailVerify => Self::EmailVerify,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if let Commands::Init = cli.command {
        return init_config(&cli.config);
    }

    let config = EngineConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let engine = Engine::open(&config).context("opening engine store")?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Org(cmd) => run_org(&engine, cmd),
        Commands::App(cmd) => run_app(&engine, cmd),
        Commands::Resolve { app, signals } => {
            let res = engine.resolve_identity(app, &signals.bag(), &signals.ctx())?;
            println!(
                "identity {} via {} (referral code {})",
                res.identity.id,
                res.via.as_str(),
                res.identity.referral_code
            );
            Ok(())
        }
        Commands::Balance {
            identity,
            consolidated,
        } => {
            let balance = engine.get_balance(identity, consolidated)?;
            println!("{balance}");
            Ok(())
        }
        Commands::Adjust {
            identity,
            delta,
            note,
        } => {
            let entry = engine.admin_adjust(identity, delta, note.as_deref())?;
            println!(
                "entry {} applied, balance now {}",
                entry.id,
                engine.get_balance(identity, false)?
            );
            Ok(())
        }
        Commands::Entries {
            identity,
            cursor,
            limit,
        } => {
            for entry in engine.ledger_entries(identity, cursor, limit)? {
                let metadata = entry
                    .metadata
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    entry.id, entry.created_at_ms, entry.reason, entry.amount, metadata
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let stats = engine.ledger_stats()?;
            println!(
                "entries {} identities {} granted {} debited {}",
                stats.entry_count, stats.identity_count, stats.total_granted, stats.total_debited
            );
            Ok(())
        }
        Commands::Claim(cmd) => run_claim(&engine, cmd),
        Commands::Waitlist(cmd) => run_waitlist(&engine, cmd),
        Commands::Invite(cmd) => run_invite(&engine, cmd),
        Commands::Charge {
            identity,
            action,
            cost,
        } => {
            let result = engine.charge_for_action(identity, &action, cost)?;
            if result.charged {
                println!(
                    "charged {} credits, {} remaining",
                    result.credits_required, result.remaining
                );
            } else {
                println!(
                    "insufficient credits: need {}, have {}",
                    result.credits_required, result.remaining
                );
            }
            Ok(())
        }
        Commands::Profile { identity, action } => {
            match engine.grant_profile_action(identity, action.into())? {
                ProfileGrantOutcome::Granted { credits_awarded } => {
                    println!("granted {credits_awarded} credits");
                }
                ProfileGrantOutcome::AlreadyGranted => println!("already granted"),
            }
            Ok(())
        }
    }
}

fn init_config(path: &PathBuf) -> Result<()> {
    use rand::RngCore;

    anyhow::ensure!(
        !path.exists(),
        "refusing to overwrite existing config at {}",
        path.display()
    );
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let config = EngineConfig::from_toml(&format!(
        "claim_token_secret_hex = \"{}\"",
        hex::encode(secret)
    ))?;
    std::fs::write(path, config.to_toml()?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run_org(engine: &Engine, cmd: OrgCommands) -> Result<()> {
    match cmd {
        OrgCommands::Create { name } => {
            let org = engine.create_org(&name)?;
            println!("organization {} created", org.id);
        }
    }
    Ok(())
}

fn load_policy(path: Option<&PathBuf>) -> Result<AppPolicy> {
    match path {
        None => Ok(AppPolicy::default()),
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(AppPolicy::from_json(&json)?)
        }
    }
}

fn run_app(engine: &Engine, cmd: AppCommands) -> Result<()> {
    match cmd {
        AppCommands::Create {
            org,
            name,
            shared_accounts,
            policy_file,
        } => {
            let policy = load_policy(policy_file.as_ref())?;
            let app = engine.create_app(org, &name, shared_accounts, &policy)?;
            println!("application {} created", app.id);
        }
        AppCommands::Show { app } => {
            let app = engine.get_app(app)?;
            println!(
                "application {} ({}) org {} shared_accounts {}",
                app.id, app.name, app.org_id, app.shared_accounts_enabled
            );
            println!("{}", serde_json::to_string_pretty(&app.policy)?);
        }
        AppCommands::SetPolicy { app, policy_file } => {
            let policy = load_policy(Some(&policy_file))?;
            engine.set_policy(app, &policy)?;
            println!("policy updated");
        }
    }
    Ok(())
}

fn run_claim(engine: &Engine, cmd: ClaimCommands) -> Result<()> {
    match cmd {
        ClaimCommands::Issue { code } => {
            let claim = engine.issue_referral_claim(&code)?;
            println!("{}", claim.token);
            println!("expires {}", claim.expires_at);
        }
        ClaimCommands::Visit { token } => {
            let referral = engine.track_referral_visit(&token)?;
            println!(
                "referral {} visits {}",
                referral.id, referral.visit_count
            );
        }
        ClaimCommands::Redeem { token, referred } => match engine
            .redeem_referral_claim(&token, referred)?
        {
            ClaimOutcome::Claimed {
                referral,
                referrer_credits,
                referred_credits,
            } => println!(
                "claimed: referral {} referrer +{} referred +{}",
                referral.id, referrer_credits, referred_credits
            ),
            ClaimOutcome::SelfReferral => println!("dropped: self-referral"),
            ClaimOutcome::AlreadyReferred => println!("dropped: already referred"),
            ClaimOutcome::DailyCapReached => println!("dropped: daily cap reached"),
        },
    }
    Ok(())
}

fn run_waitlist(engine: &Engine, cmd: WaitlistCommands) -> Result<()> {
    match cmd {
        WaitlistCommands::Join {
            app,
            email,
            signals,
        } => {
            let join = engine.join_waitlist(app, &email, &signals.bag(), &signals.ctx())?;
            println!(
                "entry {} identity {} (+{} credits{})",
                join.entry.id,
                join.identity_id,
                join.credits_awarded,
                if join.created { "" } else { ", already joined" }
            );
        }
        WaitlistCommands::Show { entry } => {
            let entry = engine.waitlist_entry(entry)?;
            println!(
                "entry {} app {} email {} status {} uses {}/{}",
                entry.id,
                entry.app_id,
                entry.email,
                entry.status.as_str(),
                entry.code_use_count,
                entry.code_max_uses
            );
        }
    }
    Ok(())
}

fn run_invite(engine: &Engine, cmd: InviteCommands) -> Result<()> {
    match cmd {
        InviteCommands::Generate {
            entry,
            expiry_days,
            max_uses,
        } => {
            let generated = engine.generate_invitation_code(entry, expiry_days, max_uses)?;
            println!("{}", generated.code);
            println!("expires {}", generated.expires_at);
        }
        InviteCommands::Redeem { code, signals } => {
            match engine.redeem_invitation_code(&code, &signals.bag(), &signals.ctx())? {
                RedemptionOutcome::Redeemed {
                    identity_id,
                    credits_awarded,
                } => println!("redeemed: identity {identity_id} +{credits_awarded} credits"),
                RedemptionOutcome::AlreadyRedeemed { identity_id } => {
                    println!("already redeemed by identity {identity_id}");
                }
                RedemptionOutcome::Expired => println!("code expired"),
                RedemptionOutcome::Exhausted => println!("code exhausted"),
            }
        }
    }
    Ok(())
}
