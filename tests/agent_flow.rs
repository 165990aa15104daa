// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use nixl_agent::engine::memory::InMemoryFabric;
use nixl_agent::*;
use std::net::{IpAddr, Ipv4Addr};

const BUF_LEN: usize = 256;

fn new_agent(fabric: &InMemoryFabric, name: &str) -> Agent {
    Agent::new(name, fabric.engine()).expect("Failed to create agent")
}

fn registered_storage(agent: &Agent) -> SystemStorage {
    let storage = SystemStorage::new(BUF_LEN).expect("Failed to allocate storage");
    agent
        .register_memory(&storage, &[])
        .expect("Failed to register memory");
    storage
}

fn localhost(port: u16) -> MetadataTarget {
    MetadataTarget::Peer {
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
    }
}

/// Splits one registered buffer into three equal descriptors
fn thirds(agent: &Agent, storage: &SystemStorage) -> XferDescList {
    let whole = agent.get_xfer_descs(storage).unwrap();
    let base = whole.get(0).unwrap().addr;
    let third = BUF_LEN / 3;
    XferDescList::from_descs(
        MemType::Dram,
        (0..3).map(|i| XferDesc::new(base + i * third, third, 0)),
    )
}

#[test]
fn test_prepped_write_with_notification() {
    let fabric = InMemoryFabric::new();
    let target = new_agent(&fabric, "target");
    let initiator = new_agent(&fabric, "initiator");
    let target_buf = registered_storage(&target);
    let initiator_buf = registered_storage(&initiator);

    let remote_name = initiator
        .load_remote_md(&target.get_local_md().unwrap())
        .unwrap();
    assert_eq!(remote_name, "target");
    assert_eq!(initiator.remote_agents().unwrap(), vec!["target".to_string()]);

    let mut local = initiator
        .prep_xfer_dlist(DlistRole::Initiator, &initiator_buf, &[])
        .unwrap();
    let remote_descs = target.get_xfer_descs(&target_buf).unwrap();
    let mut remote = initiator
        .prep_xfer_dlist(DlistRole::Remote("target".to_string()), remote_descs, &[])
        .unwrap();

    let args = OptArgs::new().with_notification(b"xfer-1");
    let mut req = initiator
        .make_prepped_xfer(XferOp::Write, &local, &[0], &remote, &[0], Some(&args))
        .unwrap();

    assert_eq!(initiator.transfer(&mut req, None).unwrap(), XferStatus::InProgress);
    assert_eq!(initiator.check_xfer_state(&mut req).unwrap(), XferStatus::Success);
    assert_eq!(initiator.check_xfer_state(&mut req).unwrap(), XferStatus::Success);
    assert_eq!(initiator.query_xfer_backend(&req).unwrap(), "UCX");

    assert!(target
        .check_remote_xfer_done("initiator", b"xfer", TagMatch::Prefix, &[])
        .unwrap());
    assert!(!target
        .check_remote_xfer_done("initiator", b"xfer", TagMatch::Prefix, &[])
        .unwrap());

    initiator.release_xfer_handle(&mut req).unwrap();
    initiator.release_dlist_handle(&mut local).unwrap();
    initiator.release_dlist_handle(&mut remote).unwrap();
}

#[test]
fn test_notification_tag_modes() {
    let fabric = InMemoryFabric::new();
    let target = new_agent(&fabric, "target");
    let initiator = new_agent(&fabric, "initiator");
    initiator
        .load_remote_md(&target.get_local_md().unwrap())
        .unwrap();

    initiator.send_notification("target", b"req-42-done", None).unwrap();
    initiator.send_notification("target", b"req-43-done", Some("UCX")).unwrap();

    assert!(!target
        .check_remote_xfer_done("initiator", b"42", TagMatch::Prefix, &[])
        .unwrap());
    assert!(target
        .check_remote_xfer_done("initiator", b"42", TagMatch::Substring, &[])
        .unwrap());

    let snapshot = target.update_notifs(&[]).unwrap();
    assert_eq!(
        snapshot.get("initiator"),
        Some([b"req-43-done".to_vec()].as_slice())
    );
    assert!(target.get_new_notifs(&[]).unwrap().is_empty());

    assert!(matches!(
        initiator.send_notification("nobody", b"hello", None),
        Err(NixlError::UnknownRemote(_))
    ));
}

#[test]
fn test_new_notifs_scoped_by_backend() {
    let fabric = InMemoryFabric::new();
    let config = || AgentConfig::with_backends(["UCX", "POSIX"]);
    let target = Agent::with_config("target", fabric.engine(), config()).unwrap();
    let initiator = Agent::with_config("initiator", fabric.engine(), config()).unwrap();
    initiator
        .load_remote_md(&target.get_local_md().unwrap())
        .unwrap();

    initiator
        .send_notification("target", b"via-posix", Some("POSIX"))
        .unwrap();
    assert!(matches!(
        target.get_new_notifs(&["BOGUS"]),
        Err(NixlError::UnknownBackend { .. })
    ));
    assert!(target.get_new_notifs(&["UCX"]).unwrap().is_empty());
    assert_eq!(fabric.pending_notifications("target"), 1);

    let notifs = target.get_new_notifs(&["POSIX"]).unwrap();
    assert_eq!(
        notifs.get("initiator"),
        Some([b"via-posix".to_vec()].as_slice())
    );
    assert_eq!(fabric.pending_notifications("target"), 0);
}

#[test]
fn test_caller_held_notification_map() {
    let fabric = InMemoryFabric::new();
    let target = new_agent(&fabric, "target");
    let initiator = new_agent(&fabric, "initiator");
    initiator
        .load_remote_md(&target.get_local_md().unwrap())
        .unwrap();

    let mut notifs = NotificationMap::new();
    notifs.push("elsewhere", b"kept".to_vec());
    initiator.send_notification("target", b"first", None).unwrap();
    target.get_notifications(&mut notifs, &[]).unwrap();
    initiator.send_notification("target", b"second", None).unwrap();
    target.get_notifications(&mut notifs, &["UCX"]).unwrap();

    assert_eq!(notifs.len(), 2);
    assert_eq!(
        notifs.get("initiator"),
        Some([b"first".to_vec(), b"second".to_vec()].as_slice())
    );
    assert!(matches!(
        target.get_notifications(&mut notifs, &["BOGUS"]),
        Err(NixlError::UnknownBackend { .. })
    ));
}

#[test]
fn test_metadata_exchange_through_listener() {
    let fabric = InMemoryFabric::new();
    let listening = AgentConfig {
        enable_listen_thread: true,
        listen_port: 9200,
        ..AgentConfig::default()
    };
    let target = Agent::with_config("target", fabric.engine(), listening).unwrap();
    let initiator = new_agent(&fabric, "initiator");

    initiator.send_local_md(&localhost(9200)).unwrap();
    assert!(target.check_remote_metadata("initiator", None).unwrap());

    initiator.fetch_remote_md("target", &localhost(9200)).unwrap();
    assert!(initiator.check_remote_metadata("target", None).unwrap());
    assert_eq!(
        initiator.peer_state("target").unwrap(),
        Some(PeerState {
            metadata_loaded: true,
            connected: false,
        })
    );

    initiator.make_connection("target", &[]).unwrap();
    assert!(initiator.peer_state("target").unwrap().unwrap().connected);

    assert!(matches!(
        initiator.send_local_md(&localhost(9300)),
        Err(NixlError::Metadata(_))
    ));
}

#[test]
fn test_peers_follow_pushed_metadata() {
    let fabric = InMemoryFabric::new();
    let listening = AgentConfig {
        enable_listen_thread: true,
        listen_port: 9400,
        ..AgentConfig::default()
    };
    let target = Agent::with_config("target", fabric.engine(), listening).unwrap();
    let initiator = new_agent(&fabric, "initiator");

    initiator.send_local_md(&localhost(9400)).unwrap();
    assert_eq!(target.remote_agents().unwrap(), vec!["initiator"]);
    assert!(target.peer_state("initiator").unwrap().unwrap().metadata_loaded);
    target.send_notification("initiator", b"hello", None).unwrap();

    let registry = MetadataTarget::registry("");
    target.send_local_md(&registry).unwrap();
    initiator.fetch_remote_md("target", &registry).unwrap();
    assert_eq!(initiator.remote_agents().unwrap(), vec!["target"]);

    target.invalidate_local_md(&registry).unwrap();
    assert!(initiator.remote_agents().unwrap().is_empty());
    assert_eq!(initiator.peer_state("target").unwrap(), None);
    assert!(matches!(
        initiator.send_notification("target", b"hello", None),
        Err(NixlError::UnknownRemote(_))
    ));
}

#[test]
fn test_metadata_exchange_through_registry() {
    let fabric = InMemoryFabric::new();
    let target = new_agent(&fabric, "target");
    let initiator = new_agent(&fabric, "initiator");
    let target_buf = registered_storage(&target);
    let registry = MetadataTarget::registry("");

    target.send_local_md(&registry).unwrap();
    initiator.fetch_remote_md("target", &registry).unwrap();
    let remote_descs = target.get_xfer_descs(&target_buf).unwrap();
    assert!(initiator
        .check_remote_metadata("target", Some(&remote_descs))
        .unwrap());

    target.invalidate_local_md(&registry).unwrap();
    assert!(!initiator.check_remote_metadata("target", None).unwrap());
    assert!(initiator.remote_agents().unwrap().is_empty());
    assert!(fabric.registry_keys().is_empty());
}

#[test]
fn test_partial_metadata_exchange() {
    let fabric = InMemoryFabric::new();
    let target = new_agent(&fabric, "target");
    let initiator = new_agent(&fabric, "initiator");
    let first = registered_storage(&target);
    let second = registered_storage(&target);

    let first_descs = target.get_reg_descs(&first).unwrap();
    let second_descs = target.get_reg_descs(&second).unwrap();
    let conn_only = target
        .get_local_partial_md(&RegDescList::new(MemType::Dram), true, &[])
        .unwrap();
    initiator.load_remote_md(&conn_only).unwrap();
    assert!(!initiator
        .check_remote_metadata("target", Some(&first_descs.trim()))
        .unwrap());

    let partial = target
        .get_local_partial_md(&first_descs, false, &[])
        .unwrap();
    initiator.load_remote_md(&partial).unwrap();
    assert!(initiator
        .check_remote_metadata("target", Some(&first_descs.trim()))
        .unwrap());
    assert!(!initiator
        .check_remote_metadata("target", Some(&second_descs.trim()))
        .unwrap());

    target
        .send_local_partial_md(&second_descs, false, &[], &MetadataTarget::registry("second"))
        .unwrap();
    initiator
        .fetch_remote_md("target", &MetadataTarget::registry("second"))
        .unwrap();
    assert!(initiator
        .check_remote_metadata("target", Some(&second_descs.trim()))
        .unwrap());
    assert!(initiator
        .check_remote_metadata("target", Some(&first_descs.trim()))
        .unwrap());

    initiator.invalidate_remote_md("target").unwrap();
    assert!(initiator.peer_state("target").unwrap().is_none());
    assert!(initiator.invalidate_remote_md("target").is_err());
}

#[test]
fn test_index_validation() {
    let fabric = InMemoryFabric::new();
    let agent = new_agent(&fabric, "solo");
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    let local = agent
        .prep_xfer_dlist(DlistRole::Initiator, thirds(&agent, &src), &[])
        .unwrap();
    let remote = agent
        .prep_xfer_dlist(DlistRole::Loopback, thirds(&agent, &dst), &[])
        .unwrap();
    assert_eq!(local.len(), 3);

    let req = agent
        .make_prepped_xfer(XferOp::Write, &local, &[0, 2], &remote, &[0, 2], None)
        .unwrap();
    drop(req);

    let err = agent
        .make_prepped_xfer(XferOp::Write, &local, &[5], &remote, &[0], None)
        .unwrap_err();
    assert!(matches!(err, NixlError::IndexOutOfRange { index: 5, len: 3 }));
    assert!(err.kind().is_validation());

    assert!(matches!(
        agent.make_prepped_xfer(XferOp::Read, &local, &[0], &remote, &[0, 1], None),
        Err(NixlError::IndexCountMismatch { local: 1, remote: 2 })
    ));
}

#[test]
fn test_unknown_backend_fails_whole_call() {
    let fabric = InMemoryFabric::new();
    let agent = new_agent(&fabric, "solo");
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    let err = agent
        .prep_xfer_dlist(DlistRole::Initiator, &src, &["UCX", "BOGUS"])
        .unwrap_err();
    match err {
        NixlError::UnknownBackend { name, available } => {
            assert_eq!(name, "BOGUS");
            assert_eq!(available, vec!["UCX".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let args = OptArgs::new().with_backend("UCX").with_backend("BOGUS");
    assert!(matches!(
        agent.initialize_xfer(XferOp::Write, &src, &dst, "solo", Some(&args)),
        Err(NixlError::UnknownBackend { .. })
    ));
}

#[test]
fn test_release_is_idempotent() {
    let fabric = InMemoryFabric::new();
    let agent = new_agent(&fabric, "solo");
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    let mut local = agent
        .prep_xfer_dlist(DlistRole::Initiator, &src, &[])
        .unwrap();
    let remote = agent.prep_xfer_dlist(DlistRole::Loopback, &dst, &[]).unwrap();
    let mut req = agent
        .initialize_xfer(XferOp::Write, &src, &dst, "solo", None)
        .unwrap();

    req.release().unwrap();
    req.release().unwrap();
    agent.release_xfer_handle(&mut req).unwrap();
    assert!(req.is_released());
    assert!(matches!(
        agent.transfer(&mut req, None),
        Err(NixlError::HandleReleased { .. })
    ));

    local.release().unwrap();
    agent.release_dlist_handle(&mut local).unwrap();
    assert!(matches!(
        agent.make_prepped_xfer(XferOp::Write, &local, &[0], &remote, &[0], None),
        Err(NixlError::HandleReleased { .. })
    ));
}

#[test]
fn test_foreign_handles_rejected() {
    let fabric = InMemoryFabric::new();
    let first = new_agent(&fabric, "first");
    let second = new_agent(&fabric, "second");
    let src = registered_storage(&first);
    let dst = registered_storage(&first);

    let local = first.prep_xfer_dlist(DlistRole::Initiator, &src, &[]).unwrap();
    let remote = first.prep_xfer_dlist(DlistRole::Loopback, &dst, &[]).unwrap();
    let err = second
        .make_prepped_xfer(XferOp::Write, &local, &[0], &remote, &[0], None)
        .unwrap_err();
    assert!(matches!(err, NixlError::ForeignHandle { ref agent, .. } if agent == "second"));

    let mut req = first
        .initialize_xfer(XferOp::Write, &src, &dst, "first", None)
        .unwrap();
    assert!(matches!(
        second.check_xfer_state(&mut req),
        Err(NixlError::ForeignHandle { .. })
    ));
}

#[test]
fn test_leaked_request_recovered() {
    let fabric = InMemoryFabric::new();
    fabric.set_polls_to_complete(10);
    fabric.set_cancellable(false);
    let agent = new_agent(&fabric, "solo");
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    {
        let mut req = agent
            .initialize_xfer(XferOp::Write, &src, &dst, "solo", None)
            .unwrap();
        assert_eq!(agent.transfer(&mut req, None).unwrap(), XferStatus::InProgress);
    }
    assert_eq!(agent.leaked_handle_count(), 1);

    assert_eq!(agent.recover_leaked_handles(), 0);
    assert_eq!(agent.leaked_handle_count(), 1);

    fabric.set_cancellable(true);
    assert_eq!(agent.recover_leaked_handles(), 1);
    assert_eq!(agent.leaked_handle_count(), 0);
}

#[test]
fn test_failed_transfer_reports_error_status() {
    let fabric = InMemoryFabric::new();
    let agent = new_agent(&fabric, "solo");
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    fabric.set_fail_transfers(true);
    let mut req = agent
        .initialize_xfer(XferOp::Write, &src, &dst, "solo", None)
        .unwrap();
    assert_eq!(agent.transfer(&mut req, None).unwrap(), XferStatus::Error);
    assert_eq!(agent.check_xfer_state(&mut req).unwrap(), XferStatus::Error);
    assert_eq!(req.terminal_status(), Some(XferStatus::Error));

    fabric.set_fail_transfers(false);
    fabric.set_polls_to_complete(0);
    assert_eq!(agent.transfer(&mut req, None).unwrap(), XferStatus::Success);
    assert_eq!(agent.check_xfer_state(&mut req).unwrap(), XferStatus::Success);
}

#[test]
fn test_equivalent_descriptor_inputs() {
    let fabric = InMemoryFabric::new();
    let agent = new_agent(&fabric, "solo");
    let storage = SystemStorage::new(BUF_LEN).unwrap();

    let from_buffer = agent.get_xfer_descs(&storage).unwrap();
    let addr = from_buffer.get(0).unwrap().addr;

    let from_tuples = agent
        .get_xfer_descs(DescriptorInput::tuples([(addr, BUF_LEN, 0u64)], MemType::Dram))
        .unwrap();
    let rows = ndarray::Array2::from_shape_vec((1, 3), vec![addr as u64, BUF_LEN as u64, 0])
        .unwrap()
        .into_dyn();
    let from_array = agent
        .get_xfer_descs(DescriptorInput::array(rows.view(), MemType::Dram))
        .unwrap();

    assert_eq!(from_buffer, from_tuples);
    assert_eq!(from_buffer, from_array);

    let reg = agent.get_reg_descs(&storage).unwrap();
    assert_eq!(reg.trim(), from_buffer);
    assert!(matches!(
        agent.get_reg_descs(from_buffer),
        Err(NixlError::WrongListKind { .. })
    ));
}

#[test]
fn test_cost_and_telemetry() {
    let fabric = InMemoryFabric::new();
    let config = AgentConfig {
        capture_telemetry: true,
        ..AgentConfig::default()
    };
    let agent = Agent::with_config("measured", fabric.engine(), config).unwrap();
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    let mut req = agent
        .initialize_xfer(XferOp::Read, &src, &dst, "measured", None)
        .unwrap();
    let estimate = agent.estimate_xfer_cost(&req).unwrap();
    assert_eq!(estimate.method, CostMethod::AnalyticalBackend);
    assert!(estimate.err_margin <= estimate.duration);

    agent.transfer(&mut req, None).unwrap();
    let telemetry = agent.get_xfer_telemetry(&req).unwrap();
    assert_eq!(telemetry.total_bytes, BUF_LEN as u64);
    assert_eq!(telemetry.desc_count, 1);

    let plain = new_agent(&fabric, "plain");
    let src = registered_storage(&plain);
    let dst = registered_storage(&plain);
    let mut req = plain
        .initialize_xfer(XferOp::Read, &src, &dst, "plain", None)
        .unwrap();
    plain.transfer(&mut req, None).unwrap();
    assert!(matches!(
        plain.get_xfer_telemetry(&req),
        Err(NixlError::NotSupported)
    ));
}

#[test]
fn test_cost_without_analytical_model() {
    let fabric = InMemoryFabric::new();
    let config = AgentConfig::with_backends(["POSIX"]);
    let agent = Agent::with_config("files", fabric.engine(), config).unwrap();
    let src = registered_storage(&agent);
    let dst = registered_storage(&agent);

    let req = agent
        .initialize_xfer(XferOp::Write, &src, &dst, "files", None)
        .unwrap();
    assert_eq!(agent.query_xfer_backend(&req).unwrap(), "POSIX");
    let estimate = agent.estimate_xfer_cost(&req).unwrap();
    assert_eq!(estimate.method, CostMethod::Unknown);
    assert_eq!(estimate.duration, std::time::Duration::ZERO);
}
