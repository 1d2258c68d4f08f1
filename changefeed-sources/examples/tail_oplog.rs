// Copyright 2025 Changefeed Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Tails the oplog of a replica set and prints a database-wide change stream.
//!
//! To run this example:
//! ```bash
//! # A replica set member must be reachable, e.g. mongod --replSet rs0
//! MONGODB_URI="mongodb://localhost:27017/?directConnection=true" \
//! RUST_LOG=changefeed_core=debug \
//!     cargo run -p changefeed-sources --features mongodb-source --example tail_oplog -- shop
//! ```
//!
//! Press Ctrl+C to stop; the last resume token is printed so the stream can
//! be resumed with `RESUME_AFTER`.

use bson::{doc, Bson, Document};
use changefeed_core::legality::FeatureCompatibilityVersion;
use changefeed_core::options::{ChangeStreamOptions, FullDocument};
use changefeed_core::resume::Role;
use changefeed_core::resume_token::ResumeToken;
use changefeed_core::scope::Namespace;
use changefeed_core::stage::{ChangeStreamPlan, StreamContext};
use changefeed_core::stream::{interrupt_channel, ChangeStream, StreamConfig, StreamItem};
use changefeed_sources::mongodb::{
    load_catalog, MongoOplogConfig, MongoOplogReader, MongoPostImageLookup,
};
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let uri = std::env::var("MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017/?directConnection=true".to_string());
    let database = std::env::args().nth(1).unwrap_or_else(|| "test".to_string());

    let config = MongoOplogConfig::builder().uri(uri.as_str()).build()?;
    let client = Client::with_uri_str(&uri).await?;

    let last = client
        .database("local")
        .collection::<Document>("oplog.rs")
        .find_one(doc! {})
        .sort(doc! { "$natural": -1 })
        .await?
        .ok_or("the oplog is empty; is this a replica set member?")?;
    let Some(Bson::Timestamp(last_applied)) = last.get("ts").cloned() else {
        return Err("oplog entry without ts".into());
    };

    let mut options = ChangeStreamOptions::builder()
        .full_document(FullDocument::UpdateLookup)
        .build();
    if let Ok(token) = std::env::var("RESUME_AFTER") {
        let json: serde_json::Value = serde_json::from_str(&token)?;
        let token = ResumeToken::from_bson(&Bson::try_from(json)?)?;
        options = options.with_resume_token(token);
    }

    let catalog = load_catalog(&client).await?;
    let ctx = StreamContext::new(
        Role::ReplicaSetMember { last_applied },
        FeatureCompatibilityVersion::V4_0,
    );
    let plan = ChangeStreamPlan::open(&Namespace::database(database.as_str()), &options, &ctx, &catalog)?;

    let (handle, interrupt) = interrupt_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.interrupt();
        }
    });

    let stream_config = StreamConfig::builder()
        .await_data_timeout(Duration::from_secs(2))
        .build()?;
    let mut stream = ChangeStream::new(
        &plan,
        MongoOplogReader::with_client(&client, &config),
        stream_config,
    )?
    .with_post_image_lookup(Arc::new(MongoPostImageLookup::new(client.clone())))
    .with_interrupt(interrupt);

    println!("Watching database '{database}' from {last_applied:?}\n");

    let mut last_token = None;
    loop {
        match stream.next().await {
            Ok(StreamItem::Event(event)) => {
                println!(
                    "{:<10} {:<24} {}",
                    event.operation.as_str(),
                    event.namespace.as_ref().map(ToString::to_string).unwrap_or_default(),
                    event
                        .document_key
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                );
                last_token = Some(event.id);
            }
            Ok(StreamItem::Pending) => {}
            Ok(StreamItem::Invalidated | StreamItem::Exhausted) => {
                println!("\nStream closed");
                break;
            }
            Err(changefeed_core::ChangeStreamError::Interrupted) => {
                println!("\nInterrupted");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(token) = last_token {
        let token = serde_json::to_string(&Bson::Document(token.to_document()?).into_relaxed_extjson())?;
        println!("Resume with RESUME_AFTER='{token}'");
    }

    Ok(())
}
