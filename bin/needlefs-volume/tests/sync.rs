//! Leader and follower volume servers over real gRPC connections

use needlefs_client::{SyncOutcome, VolumeServerPool, VolumeSyncer};
use needlefs_common::{Cookie, Error, FileId, NeedleId, NeedleMapKind, VolumeId};
use needlefs_proto::volume::volume_server_client::VolumeServerClient;
use needlefs_proto::volume::volume_server_server::{VolumeServer, VolumeServerServer};
use needlefs_proto::volume::{
    AllocateVolumeRequest, AllocateVolumeResponse, BatchDeleteRequest, BatchDeleteResponse,
    DeleteNeedleRequest, DeleteNeedleResponse, ReadNeedleRequest, ReadNeedleResponse,
    VolumeSyncDataRequest, VolumeSyncDataResponse, VolumeSyncIndexRequest,
    VolumeSyncIndexResponse, VolumeSyncStatusRequest, VolumeSyncStatusResponse,
    WriteNeedleRequest, WriteNeedleResponse,
};
use needlefs_replication::Notifier;
use needlefs_storage::{Needle, Store, Volume};
use needlefs_volume::follower::sync_round;
use needlefs_volume::grpc_server;
use needlefs_volume::service::VolumeService;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};

const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

struct TestServer {
    store: Arc<Store>,
    /// HTTP-style address whose gRPC port is the one served here
    http_address: String,
    _dir: TempDir,
}

fn open_store(kind: NeedleMapKind, volumes: &[u32]) -> (Arc<Store>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path(), kind).unwrap());
    for &id in volumes {
        store.allocate_volume(VolumeId::new(id)).unwrap();
    }
    (store, dir)
}

fn volume_service(store: &Arc<Store>) -> Arc<VolumeService> {
    Arc::new(VolumeService::new(
        Arc::clone(store),
        Notifier::disabled(),
        100,
    ))
}

/// Serve on a random loopback port; returns the HTTP-style address
async fn serve<S: VolumeServer>(server: VolumeServerServer<S>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let grpc_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        Server::builder()
            .add_service(server)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });
    // Ephemeral ports sit well above the 10000 gRPC offset
    format!("127.0.0.1:{}", grpc_port - 10000)
}

/// Start a volume server on a random loopback port with the given volumes
async fn start_server(kind: NeedleMapKind, volumes: &[u32]) -> TestServer {
    let (store, dir) = open_store(kind, volumes);
    let http_address = serve(grpc_server(volume_service(&store), MAX_MESSAGE_SIZE)).await;

    TestServer {
        store,
        http_address,
        _dir: dir,
    }
}

/// How a [`FaultyLeader`] breaks its sync streams
#[derive(Clone, Copy, Debug)]
enum Fault {
    /// Index stream fails with `unavailable` after its first chunk
    IndexUnavailable,
    /// Data stream fails with `unavailable` after its first chunk
    DataUnavailable,
    /// Index stream stops after its first chunk without closing
    IndexStalls,
}

/// Leader that serves a real volume but breaks one sync stream midway
struct FaultyLeader {
    inner: Arc<VolumeService>,
    fault: Fault,
    first_chunk_sent: Arc<Notify>,
}

impl FaultyLeader {
    /// Forward the first chunk of `upstream`, then fail or stall
    fn break_after_first<T: Send + 'static>(
        &self,
        mut upstream: ReceiverStream<Result<T, Status>>,
        stall: bool,
    ) -> ReceiverStream<Result<T, Status>> {
        let (tx, rx) = mpsc::channel(1);
        let sent = Arc::clone(&self.first_chunk_sent);
        tokio::spawn(async move {
            if let Some(first) = upstream.next().await {
                if tx.send(first).await.is_err() {
                    return;
                }
            }
            sent.notify_one();
            if stall {
                tx.closed().await;
            } else {
                let _ = tx.send(Err(Status::unavailable("leader restarting"))).await;
            }
        });
        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl VolumeServer for FaultyLeader {
    async fn batch_delete(
        &self,
        request: Request<BatchDeleteRequest>,
    ) -> Result<Response<BatchDeleteResponse>, Status> {
        self.inner.batch_delete(request).await
    }

    async fn volume_sync_status(
        &self,
        request: Request<VolumeSyncStatusRequest>,
    ) -> Result<Response<VolumeSyncStatusResponse>, Status> {
        self.inner.volume_sync_status(request).await
    }

    type VolumeSyncIndexStream = ReceiverStream<Result<VolumeSyncIndexResponse, Status>>;

    async fn volume_sync_index(
        &self,
        request: Request<VolumeSyncIndexRequest>,
    ) -> Result<Response<Self::VolumeSyncIndexStream>, Status> {
        let upstream = self.inner.volume_sync_index(request).await?.into_inner();
        Ok(Response::new(match self.fault {
            Fault::IndexUnavailable => self.break_after_first(upstream, false),
            Fault::IndexStalls => self.break_after_first(upstream, true),
            Fault::DataUnavailable => upstream,
        }))
    }

    type VolumeSyncDataStream = ReceiverStream<Result<VolumeSyncDataResponse, Status>>;

    async fn volume_sync_data(
        &self,
        request: Request<VolumeSyncDataRequest>,
    ) -> Result<Response<Self::VolumeSyncDataStream>, Status> {
        let upstream = self.inner.volume_sync_data(request).await?.into_inner();
        Ok(Response::new(match self.fault {
            Fault::DataUnavailable => self.break_after_first(upstream, false),
            Fault::IndexUnavailable | Fault::IndexStalls => upstream,
        }))
    }

    async fn allocate_volume(
        &self,
        request: Request<AllocateVolumeRequest>,
    ) -> Result<Response<AllocateVolumeResponse>, Status> {
        self.inner.allocate_volume(request).await
    }

    async fn write_needle(
        &self,
        request: Request<WriteNeedleRequest>,
    ) -> Result<Response<WriteNeedleResponse>, Status> {
        self.inner.write_needle(request).await
    }

    async fn read_needle(
        &self,
        request: Request<ReadNeedleRequest>,
    ) -> Result<Response<ReadNeedleResponse>, Status> {
        self.inner.read_needle(request).await
    }

    async fn delete_needle(
        &self,
        request: Request<DeleteNeedleRequest>,
    ) -> Result<Response<DeleteNeedleResponse>, Status> {
        self.inner.delete_needle(request).await
    }
}

/// Leader with 20 needles in volume 1 whose streams break as `fault` says
async fn start_faulty_leader(fault: Fault) -> (String, Arc<Notify>, Arc<Store>, TempDir) {
    let (store, dir) = open_store(NeedleMapKind::BTree, &[1]);
    for key in 1..=20u64 {
        store
            .write_needle(
                VolumeId::new(1),
                &Needle::new(NeedleId::new(key), Cookie::new(7), vec![1u8; 40]),
            )
            .unwrap();
    }

    let first_chunk_sent = Arc::new(Notify::new());
    let leader = FaultyLeader {
        inner: volume_service(&store),
        fault,
        first_chunk_sent: Arc::clone(&first_chunk_sent),
    };
    let http_address = serve(VolumeServerServer::new(leader)).await;
    (http_address, first_chunk_sent, store, dir)
}

/// Volume files of a follower, for before/after comparison
fn volume_files(dir: &std::path::Path) -> (Vec<u8>, Vec<u8>) {
    (
        std::fs::read(dir.join("1.idx")).unwrap(),
        std::fs::read(dir.join("1.dat")).unwrap(),
    )
}

fn assert_no_staging_files(dir: &std::path::Path) {
    assert!(!dir.join("1.idx.sync").exists());
    assert!(!dir.join("1.dat.sync").exists());
}

/// Follower volume 1 with a few local needles of its own
fn local_follower() -> (Arc<Store>, TempDir, Arc<Volume>) {
    let (store, dir) = open_store(NeedleMapKind::Compact, &[1]);
    let volume = store.volume(VolumeId::new(1)).unwrap();
    for key in 100..105u64 {
        volume
            .write_needle(&Needle::new(NeedleId::new(key), Cookie::new(1), vec![2u8; 10]))
            .unwrap();
    }
    volume.delete_needle(NeedleId::new(101)).unwrap();
    volume.sync().unwrap();
    (store, dir, volume)
}

async fn client(server: &TestServer) -> VolumeServerClient<Channel> {
    let grpc = needlefs_client::to_grpc_address(&server.http_address).unwrap();
    VolumeServerPool::connect_grpc(&grpc).await.unwrap()
}

fn fid(vid: u32, key: u64, cookie: u32) -> String {
    FileId::new(VolumeId::new(vid), NeedleId::new(key), Cookie::new(cookie)).to_string()
}

async fn write(client: &mut VolumeServerClient<Channel>, file_id: String, len: usize) {
    client
        .write_needle(WriteNeedleRequest {
            file_id,
            data: vec![7u8; len],
            is_chunk_manifest: false,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_follower_catches_up_with_leader() {
    let leader = start_server(NeedleMapKind::BTree, &[1]).await;
    let follower = start_server(NeedleMapKind::Compact, &[1]).await;
    let mut leader_client = client(&leader).await;

    for key in 1..=50u64 {
        write(&mut leader_client, fid(1, key, 0x1000 + key as u32), key as usize).await;
    }
    // Overwrites and deletes
    for key in (1..=50u64).step_by(5) {
        write(&mut leader_client, fid(1, key, 0x1000 + key as u32), 3).await;
    }
    for key in (2..=50u64).step_by(7) {
        leader_client
            .delete_needle(DeleteNeedleRequest {
                file_id: fid(1, key, 0x1000 + key as u32),
            })
            .await
            .unwrap();
    }

    let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), &leader.http_address);
    let cancel = CancellationToken::new();

    let results = syncer.sync_store(&follower.store, &cancel).await;
    assert_eq!(results.len(), 1);
    let (vid, outcome) = &results[0];
    assert_eq!(*vid, VolumeId::new(1));
    let leader_volume = leader.store.volume(VolumeId::new(1)).unwrap();
    let leader_status = leader_volume.sync_status().unwrap();
    match outcome {
        Ok(SyncOutcome::Resynced {
            bytes, data_bytes, ..
        }) => {
            assert_eq!(*bytes, leader_status.idx_file_size);
            assert_eq!(*data_bytes, leader_volume.data_size());
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let follower_volume = follower.store.volume(VolumeId::new(1)).unwrap();
    let follower_status = follower_volume.sync_status().unwrap();
    assert_eq!(follower_status.idx_file_size, leader_status.idx_file_size);
    assert_eq!(follower_status.metric, leader_status.metric);

    let leader_index = leader_volume.index();
    let follower_index = follower_volume.index();
    assert_eq!(follower_index.len(), leader_index.len());
    for key in 1..=50u64 {
        assert_eq!(
            follower_index.get(NeedleId::new(key)),
            leader_index.get(NeedleId::new(key)),
            "key {}",
            key
        );
    }

    // Synced needles are readable on the follower, and new writes there
    // do not land on top of them
    let mut follower_client = client(&follower).await;
    let read = follower_client
        .read_needle(ReadNeedleRequest {
            file_id: fid(1, 6, 0x1006),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(read.data, vec![7u8; 3]);
    write(&mut follower_client, fid(1, 60, 60), 9).await;
    for key in [1u64, 6, 50] {
        assert!(follower_volume.read_needle(NeedleId::new(key)).is_ok(), "key {}", key);
    }
    assert!(follower_volume.read_needle(NeedleId::new(60)).is_ok());

    // The local write diverged from the leader: the next round resyncs
    let summary = sync_round(&syncer, &follower.store, &cancel).await;
    assert_eq!(summary.resynced, 1);
    assert!(follower_volume.index().get(NeedleId::new(60)).is_none());
    assert_eq!(&follower_volume.read_needle(NeedleId::new(6)).unwrap().data[..], &[7u8; 3]);

    // Nothing changed since: the next round is a no-op
    let summary = sync_round(&syncer, &follower.store, &cancel).await;
    assert_eq!(summary.up_to_date, 1);
    assert_eq!(summary.resynced, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_volume_unknown_to_leader() {
    let leader = start_server(NeedleMapKind::BTree, &[1]).await;
    let follower = start_server(NeedleMapKind::BTree, &[1, 2]).await;

    let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), &leader.http_address);
    let results = syncer
        .sync_store(&follower.store, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0].1, Ok(SyncOutcome::UpToDate)));
    assert!(matches!(results[1].1, Err(Error::VolumeMismatch { .. })));
}

#[tokio::test]
async fn test_cancelled_sync_keeps_local_index() {
    let leader = start_server(NeedleMapKind::BTree, &[1]).await;
    let follower = start_server(NeedleMapKind::BTree, &[1]).await;
    let mut leader_client = client(&leader).await;
    write(&mut leader_client, fid(1, 1, 1), 10).await;

    let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), &leader.http_address);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let volume = follower.store.volume(VolumeId::new(1)).unwrap();
    let result = syncer.sync_volume(&volume, &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(volume.index().is_empty());
    assert_eq!(volume.sync_status().unwrap().idx_file_size, 0);
}

#[tokio::test]
async fn test_index_stream_failure_keeps_local_volume() {
    let (leader, _, _leader_store, _leader_dir) =
        start_faulty_leader(Fault::IndexUnavailable).await;
    let (_store, dir, volume) = local_follower();
    let before = volume.sync_status().unwrap();
    let files = volume_files(dir.path());

    let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), leader);
    let result = syncer.sync_volume(&volume, &CancellationToken::new()).await;

    match result {
        Err(e) => assert!(e.is_retryable(), "expected a retryable error, got {:?}", e),
        Ok(outcome) => panic!("expected failure, got {:?}", outcome),
    }
    assert_eq!(volume.sync_status().unwrap(), before);
    assert_eq!(volume_files(dir.path()), files);
    assert_no_staging_files(dir.path());
    assert!(volume.read_needle(NeedleId::new(100)).is_ok());
}

#[tokio::test]
async fn test_data_stream_failure_keeps_local_volume() {
    let (leader, _, _leader_store, _leader_dir) =
        start_faulty_leader(Fault::DataUnavailable).await;
    let (_store, dir, volume) = local_follower();
    let before = volume.sync_status().unwrap();
    let files = volume_files(dir.path());

    let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), leader);
    let result = syncer.sync_volume(&volume, &CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Retryable(_))));
    assert_eq!(volume.sync_status().unwrap(), before);
    assert_eq!(volume_files(dir.path()), files);
    assert_no_staging_files(dir.path());
    assert!(volume.read_needle(NeedleId::new(104)).is_ok());
}

#[tokio::test]
async fn test_cancel_mid_stream_keeps_local_volume() {
    let (leader, first_chunk_sent, _leader_store, _leader_dir) =
        start_faulty_leader(Fault::IndexStalls).await;
    let (_store, dir, volume) = local_follower();
    let before = volume.sync_status().unwrap();
    let files = volume_files(dir.path());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            first_chunk_sent.notified().await;
            cancel.cancel();
        });
    }

    let syncer = VolumeSyncer::new(Arc::new(VolumeServerPool::new()), leader);
    let result = syncer.sync_volume(&volume, &cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(volume.sync_status().unwrap(), before);
    assert_eq!(volume_files(dir.path()), files);
    assert_no_staging_files(dir.path());
}

#[tokio::test]
async fn test_batch_delete_over_grpc() {
    let server = start_server(NeedleMapKind::BTree, &[3]).await;
    let mut client = client(&server).await;

    write(&mut client, fid(3, 0x10, 0xaaaa), 4).await;
    write(&mut client, fid(3, 0x11, 0xbbbb), 6).await;
    client
        .write_needle(WriteNeedleRequest {
            file_id: fid(3, 0x12, 0xcccc),
            data: b"[]".to_vec(),
            is_chunk_manifest: true,
        })
        .await
        .unwrap();

    let results = client
        .batch_delete(BatchDeleteRequest {
            file_ids: vec![
                fid(3, 0x10, 0xaaaa),
                fid(3, 0x12, 0xcccc),
                fid(3, 0x99, 0xaaaa),
                "3,zz".to_string(),
                fid(3, 0x11, 0xbbbb),
            ],
        })
        .await
        .unwrap()
        .into_inner()
        .results;

    let statuses: Vec<i32> = results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![202, 406, 404, 400, 202]);
    assert_eq!(results[0].size, 4);
    assert_eq!(results[4].size, 6);
    assert!(results[1].error.contains("ChunkManifest"));

    let volume = server.store.volume(VolumeId::new(3)).unwrap();
    assert_eq!(volume.index().len(), 1);
    assert_eq!(volume.sync_status().unwrap().metric.deleted_count, 2);
}
