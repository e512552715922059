use clap::{crate_version, App, Arg};
use h2client::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = App::new("h2client")
        .version(crate_version!())
        .arg(Arg::with_name("url").required(true).index(1))
        .get_matches();
    let url = matches.value_of("url").expect("missing url");

    let client = Client::default();
    match client.get(url, None).await {
        Ok(response) => {
            eprintln!("{} {}", response.protocol, response.status);
            println!("{}", response.text());
        }
        Err(err) => eprintln!("{err:#?}"),
    }
    client.close().await;
    Ok(())
}
