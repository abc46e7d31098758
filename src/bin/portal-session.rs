use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use portal_session::auth::{Clock, Liveness, SystemClock, TokenCodec, DEFAULT_EXPIRY_WINDOW_SECS};
use portal_session::config::PortalOptions;
use portal_session::guard::EdgeDecision;
use portal_session::Portal;

fn cli() -> Command<'static> {
    Command::new("portal-session")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect tokens, edge routing and logins for the feedback portals")
        .subcommand_required(true)
        .subcommand(
            Command::new("decode")
                .about("Print the claims and liveness of an access token")
                .arg(Arg::new("token").required(true).takes_value(true)),
        )
        .subcommand(
            Command::new("route")
                .about("Show what the edge redirector does for a path")
                .arg(Arg::new("path").required(true).takes_value(true))
                .arg(
                    Arg::new("cookie")
                        .short('c')
                        .long("cookie")
                        .value_name("TOKEN")
                        .help("Value of the credential cookie")
                        .takes_value(true),
                ),
        )
        .subcommand(
            Command::new("login")
                .about("Log in against PORTAL_API_URL and print the user")
                .arg(Arg::new("username").required(true).takes_value(true))
                .arg(Arg::new("password").required(true).takes_value(true)),
        )
}

fn decode(matches: &ArgMatches) -> anyhow::Result<()> {
    let token = matches
        .get_one::<String>("token")
        .context("missing token")?;
    let claims = TokenCodec::decode(token)?;
    let now = SystemClock.now();

    println!("subject:  {}", claims.subject.as_deref().unwrap_or("-"));
    println!("role:     {}", claims.subject_role);
    println!("roles:    {}", claims.roles.join(", "));
    println!("expires:  {} ({}s from now)", claims.expires_at, claims.expires_at - now);
    let liveness = TokenCodec::liveness(token, now, DEFAULT_EXPIRY_WINDOW_SECS);
    println!("liveness: {:?}", liveness);
    Ok(())
}

fn route(matches: &ArgMatches) -> anyhow::Result<()> {
    let target = matches.get_one::<String>("path").context("missing path")?;
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target.as_str(), None),
    };
    let cookie = matches.get_one::<String>("cookie").map(String::as_str);

    let portal = Portal::new(PortalOptions::from_env())?;
    match portal.edge().decide(path, query, cookie, SystemClock.now()) {
        EdgeDecision::Pass => println!("pass"),
        EdgeDecision::Redirect(location) => println!("redirect -> {}", location),
    }
    Ok(())
}

async fn login(matches: &ArgMatches) -> anyhow::Result<()> {
    let username = matches.get_one::<String>("username").context("missing username")?;
    let password = matches.get_one::<String>("password").context("missing password")?;

    let portal = Portal::new(PortalOptions::from_env())?;
    let session = portal.login(username, password).await?;
    let user = match session.user {
        Some(user) => user,
        None => bail!("login returned no user"),
    };

    println!("{}", serde_json::to_string_pretty(&*user)?);
    if let Some(token) = session.access_token.as_deref() {
        if TokenCodec::liveness(token, SystemClock.now(), DEFAULT_EXPIRY_WINDOW_SECS)
            != Liveness::Live
        {
            eprintln!("warning: the issued access token is already expiring");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("decode", sub)) => decode(sub),
        Some(("route", sub)) => route(sub),
        Some(("login", sub)) => login(sub).await,
        _ => unreachable!("subcommand_required"),
    }
}
