//! camo-url-tool - sign and verify camo URLs from the command line

use clap::{Parser, Subcommand};

use camo_proxy::encoding::{decode_url, encode_url, Codec};

#[derive(Parser, Debug)]
#[command(name = "camo-url-tool")]
#[command(version, about = "Sign and verify camo-proxy URLs", long_about = None)]
struct Args {
    /// HMAC key
    #[arg(short, long, env = "CAMO_KEY", hide_env_values = true)]
    key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign a target URL
    Encode {
        /// Use base64 instead of hex
        #[arg(short, long)]
        base64: bool,

        /// Prefix prepended to the signed path, e.g. https://camo.example.com
        #[arg(short, long, default_value = "")]
        prefix: String,

        url: String,
    },
    /// Verify a signed URL and print its target
    Decode { url: String },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.key.is_empty() {
        anyhow::bail!("HMAC key must not be empty");
    }

    match args.command {
        Command::Encode {
            base64,
            prefix,
            url,
        } => {
            let codec = if base64 { Codec::Base64 } else { Codec::Hex };
            let path = encode_url(codec, args.key.as_bytes(), &url)?;
            println!("{}{}", prefix.trim_end_matches('/'), path);
        }
        Command::Decode { url } => {
            let (digest, payload) = signed_parts(&url)
                .ok_or_else(|| anyhow::anyhow!("expected a URL ending in /<digest>/<payload>"))?;
            let target = decode_url(args.key.as_bytes(), digest, payload)?;
            println!("{}", target);
        }
    }
    Ok(())
}

/// Last two path segments of a signed URL, ignoring any query
fn signed_parts(url: &str) -> Option<(&str, &str)> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let mut segments = path.trim_end_matches('/').rsplit('/');
    let payload = segments.next().filter(|s| !s.is_empty())?;
    let digest = segments.next().filter(|s| !s.is_empty())?;
    Some((digest, payload))
}
