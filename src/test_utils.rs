use std::env;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::config::get_endpoint_uri;

#[derive(Deserialize, Debug)]
struct Init {
    completed: bool,
}

/// Poll the `<localstack_url>/_localstack/init/ready` endpoint until LocalStack
/// reports its init hooks have completed, giving up after one minute.
///
/// # Panic
///
/// This function will panic on any kind of failure
pub async fn wait_for_localstack() {
    // Outside of docker, LocalStack is expected at localhost:4566.
    if env::var("LOCALSTACK_HOSTNAME").is_err() {
        env::set_var("LOCALSTACK_HOSTNAME", "localhost");
    }
    env::set_var("AWS_DEFAULT_REGION", "ap-southeast-2");

    let uri = get_endpoint_uri().unwrap().unwrap();
    let now = Instant::now();
    loop {
        match reqwest::get(&format!("{}_localstack/init/ready", uri)).await {
            Err(_) => {
                panic!("Unable to connect to localstack at {uri}. To run localstack locally, run `docker run -d -p 4566:4566 localstack/localstack`");
            }
            Ok(response) => {
                let init: Init = response.json().await.unwrap();
                if init.completed {
                    break;
                }
            }
        }
        if now.elapsed() > Duration::from_secs(60) {
            panic!("Timed out while waiting for localstack at {uri} to initialise!")
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
