use anyhow::Result;

use isolar_bridge::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();
    isolar_bridge::app(options).await
}
