use std::time::Duration;

use keelson_api::{ConsumeRequest, LogClient, ProduceRequest, Record};
use keelson_standalone::{Agent, Config};
use tonic::Code;

async fn spawn_agent(i: usize, bootstrap: bool, start_join_addrs: Vec<String>) -> (Agent, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let agent = Agent::new(Config {
        data_dir: tmp.path().to_path_buf(),
        node_name: format!("node-{i}"),
        bind_addr: "127.0.0.1:0".to_string(),
        rpc_port: 0,
        start_join_addrs,
        bootstrap,
        ..Config::default()
    })
    .await
    .unwrap();
    (agent, tmp)
}

async fn client_of(agent: &Agent) -> LogClient<tonic::transport::Channel> {
    LogClient::connect(format!("http://{}", agent.rpc_addr()))
        .await
        .unwrap()
}

fn record(value: impl Into<Vec<u8>>) -> ProduceRequest {
    ProduceRequest {
        record: Some(Record {
            value: value.into(),
            ..Default::default()
        }),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_replicates_and_serves_consumes_everywhere() {
    let (leader, _d0) = spawn_agent(0, true, vec![]).await;
    leader.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let seed = leader.gossip_addr().to_string();
    let (follower1, _d1) = spawn_agent(1, false, vec![seed.clone()]).await;
    let (follower2, _d2) = spawn_agent(2, false, vec![seed]).await;

    // Gossip delivers the joins to the leader, which adds both voters.
    let mut leader_client = client_of(&leader).await;
    let want: Vec<Vec<u8>> = (0..100u32)
        .map(|i| format!("record-{i}").into_bytes())
        .collect();

    // Wait until the cluster accepts appends with all members attached,
    // then produce the full batch.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match leader_client.produce(record(want[0].clone())).await {
            Ok(response) => {
                assert_eq!(response.into_inner().offset, 0);
                break;
            }
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(status) => panic!("leader never accepted produce: {status}"),
        }
    }
    for value in &want[1..] {
        leader_client.produce(record(value.clone())).await.unwrap();
    }

    // Every node converges on the same records within a bounded time.
    for follower in [&follower1, &follower2] {
        let mut client = client_of(follower).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let caught_up = follower.log().highest_offset() == 99;
            if caught_up {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "follower never caught up, at offset {}",
                follower.log().highest_offset()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for (offset, value) in want.iter().enumerate() {
            let consumed = client
                .consume(ConsumeRequest {
                    offset: offset as u64,
                })
                .await
                .unwrap()
                .into_inner();
            let got = consumed.record.unwrap();
            assert_eq!(got.offset, offset as u64);
            assert_eq!(&got.value, value, "offset {offset} diverged");
        }
    }

    // Reading past the head stays a typed out-of-range error.
    let status = leader_client
        .consume(ConsumeRequest { offset: 100 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);

    for agent in [&leader, &follower1, &follower2] {
        agent.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_round_trip() {
    let (agent, _dir) = spawn_agent(9, true, vec![]).await;
    agent.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let mut client = client_of(&agent).await;
    let offset = client
        .produce(record(&b"hello world"[..]))
        .await
        .unwrap()
        .into_inner()
        .offset;
    assert_eq!(offset, 0);

    let consumed = client
        .consume(ConsumeRequest { offset: 0 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(consumed.record.unwrap().value, b"hello world");

    agent.shutdown().await.unwrap();
}
