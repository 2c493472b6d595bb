// src/main.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use ethers::utils::format_ether;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use pq_delegate::bundler::PimlicoClient;
use pq_delegate::chain::{read_account, ProviderChainReader};
use pq_delegate::codec::{decode_fixed, encode_hex};
use pq_delegate::config::{Deployment, Mode, PipelineSettings, ReceiptPolling, SEPOLIA_CHAIN_ID};
use pq_delegate::delegation::DelegationDetector;
use pq_delegate::falcon::FalconSigner;
use pq_delegate::signer::halo::{HaloSigner, SoftCard};
use pq_delegate::signer::{ClassicalSigner, ConnectedSigner, DEFAULT_SIGNING_PATH};
use pq_delegate::types::PaymasterContext;
use pq_delegate::{PipelineError, SubmissionPipeline, SubmitOutcome, TransferRequest};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "ETH_RPC_URL")]
    eth_rpc_url: String,

    #[clap(long, env = "BUNDLER_URL")]
    bundler_url: Option<String>,

    #[clap(short, long, env = "CHAIN_ID", default_value_t = SEPOLIA_CHAIN_ID)]
    chain_id: u64,

    #[clap(long, env = "SPONSORSHIP_POLICY_ID")]
    sponsorship_policy_id: Option<String>,

    /// 32-byte hex seed of the Falcon key.
    #[clap(long, env = "PQ_SEED", hide_env_values = true)]
    pq_seed: Option<String>,

    /// Private key answering for the tap card.
    #[clap(long, env = "CARD_PRIVATE_KEY", hide_env_values = true)]
    card_key: Option<String>,

    #[clap(long, env = "SIGNING_PATH", default_value = DEFAULT_SIGNING_PATH)]
    signing_path: String,

    #[clap(long, env = "RECEIPT_POLL_INTERVAL_MS", default_value_t = 2000)]
    receipt_poll_interval_ms: u64,

    #[clap(long, env = "RECEIPT_MAX_ATTEMPTS", default_value_t = 90)]
    receipt_max_attempts: u32,

    #[clap(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send ether from the card's account, delegating it first if needed.
    Send {
        destination: String,

        /// Amount in ether.
        amount: String,

        #[clap(short, long, default_value = "standard")]
        mode: Mode,

        /// Public-key commitment for installing the zk delegate.
        #[clap(long, env = "PUBLIC_KEY_COMMITMENT")]
        commitment: Option<String>,

        /// In zk mode, submit directly without waiting for a proof.
        #[clap(long)]
        no_proof: bool,
    },
    /// Show balance, nonce and delegation status.
    Account { address: Option<Address> },
    /// Print the Falcon public key derived from the seed.
    PqKeygen,
}

fn pq_seed(args: &Args) -> anyhow::Result<[u8; 32]> {
    let seed = args.pq_seed.as_deref().ok_or_else(|| anyhow!("PQ_SEED is not set"))?;
    Ok(decode_fixed::<32>(seed).context("PQ_SEED must be 32 bytes of hex")?)
}

fn card(args: &Args) -> anyhow::Result<HaloSigner<SoftCard>> {
    let key = args.card_key.as_deref().ok_or_else(|| anyhow!("CARD_PRIVATE_KEY is not set"))?;
    let wallet = key.parse::<LocalWallet>()?;
    Ok(HaloSigner::new(SoftCard::new(wallet)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let level: Level = args.log_level.parse()?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &args.command {
        Command::Send {
            destination,
            amount,
            mode,
            commitment,
            no_proof,
        } => {
            let bundler_url = args
                .bundler_url
                .as_deref()
                .ok_or_else(|| anyhow!("BUNDLER_URL is not set"))?;

            let mut settings = PipelineSettings::new(
                args.chain_id,
                pq_seed(&args)?,
                PaymasterContext {
                    sponsorship_policy_id: args.sponsorship_policy_id.clone(),
                },
            );
            settings.signing_path = args.signing_path.clone();
            settings.proof_required = !*no_proof;
            settings.receipt_polling = ReceiptPolling {
                interval: Duration::from_millis(args.receipt_poll_interval_ms),
                max_attempts: args.receipt_max_attempts,
            };

            let card = card(&args)?;
            let signer = ConnectedSigner::connect(&card, &settings.signing_path).await?;
            let chain = Arc::new(ProviderChainReader::new(&args.eth_rpc_url)?);
            let bundler = Arc::new(PimlicoClient::new(bundler_url)?);
            let mut pipeline = SubmissionPipeline::new(settings, chain, bundler);

            let mut request = TransferRequest {
                destination: destination.clone(),
                amount: amount.clone(),
                mode: *mode,
                public_key_commitment: commitment.clone(),
                proof: None,
            };
            let mut stdin = BufReader::new(tokio::io::stdin()).lines();

            loop {
                match pipeline.submit(&signer, &request).await {
                    Ok(SubmitOutcome::AwaitingProof(packet)) => {
                        info!("Proof input follows; paste the proof packet on one line");
                        println!("{}", packet);
                    }
                    Ok(SubmitOutcome::Submitted(receipt)) => {
                        println!("User operation: {:?}", receipt.user_op_hash);
                        println!("Transaction: {:?}", receipt.transaction_hash);
                        if !receipt.success {
                            bail!("user operation reverted");
                        }
                        return Ok(());
                    }
                    Err(PipelineError::ProofFormat(e)) => {
                        error!("Rejected proof packet: {}", e);
                    }
                    Err(PipelineError::Unconfirmed { user_op_hash, source }) => {
                        println!("User operation: {:?}", user_op_hash);
                        bail!("user operation sent but not confirmed, do not resend: {}", source);
                    }
                    Err(e) => return Err(e.into()),
                }
                let line = stdin
                    .next_line()
                    .await?
                    .ok_or_else(|| anyhow!("no proof packet supplied"))?;
                request.proof = Some(line);
            }
        }
        Command::Account { address } => {
            let address = match address {
                Some(address) => *address,
                None => card(&args)?.device_account(&args.signing_path).await?.address,
            };
            let chain = ProviderChainReader::new(&args.eth_rpc_url)?;
            let account = read_account(&chain, address).await?;
            let deployment = Deployment::default();
            let status = DelegationDetector::new(&deployment).status(&account.code);

            println!("Address: {:?}", account.address);
            println!("Balance: {} ETH", format_ether(account.balance));
            println!("Nonce:   {}", account.nonce);
            println!("Status:  {}", status);
        }
        Command::PqKeygen => {
            let keypair = FalconSigner::default().keypair_from(&pq_seed(&args)?)?;
            println!("{}", encode_hex(&keypair.public_key));
        }
    }

    Ok(())
}
