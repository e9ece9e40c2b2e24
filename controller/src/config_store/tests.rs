use super::*;
use crate::client_codec::ClientPatch;
use crate::notify::LogNotifier;
use crate::test_support::{memory_datastore, LiveCall, RecordingLiveSync};

const ALICE_ID: &str = "0e6f1bd4-5c7a-4d38-8a0e-9c1f2a3b4c01";
const BOB_ID: &str = "0e6f1bd4-5c7a-4d38-8a0e-9c1f2a3b4c02";

async fn setup() -> (ConfigStore, Arc<RecordingLiveSync>, Arc<Datastore>) {
    let db = memory_datastore().await;
    let live = RecordingLiveSync::new();
    let store = ConfigStore::new(
        db.clone(),
        Arc::new(SettingsCache::new()),
        live.clone(),
        Arc::new(LogNotifier),
    );
    (store, live, db)
}

fn vless_settings(clients: &[(&str, &str)]) -> String {
    let clients: Vec<Value> = clients
        .iter()
        .map(|(id, email)| serde_json::json!({"id": id, "email": email}))
        .collect();
    serde_json::json!({"clients": clients, "decryption": "none"}).to_string()
}

fn draft(user_id: i64, port: i64) -> InboundDraft {
    InboundDraft {
        user_id,
        remark: String::new(),
        enable: true,
        expiry_time: None,
        traffic_limit: None,
        listen: String::new(),
        port,
        protocol: "vless".to_string(),
        settings: vless_settings(&[(ALICE_ID, "alice")]),
        stream_settings: r#"{"network": "tcp"}"#.to_string(),
        sniffing: r#"{"enabled": false}"#.to_string(),
        tag: None,
    }
}

fn new_client(email: &str) -> Client {
    Client::new(email).with_id(uuid::Uuid::new_v4().to_string())
}

#[tokio::test]
async fn test_port_conflict_between_enabled_inbounds() {
    let (store, _, _) = setup().await;
    store.add_inbound(&draft(1, 443)).await.unwrap();

    let err = store.add_inbound(&draft(2, 443)).await.unwrap_err();
    assert!(err.is_conflict());

    // 停用的入站不占端口
    let mut disabled = draft(2, 443);
    disabled.enable = false;
    let (idle, need_restart) = store.add_inbound(&disabled).await.unwrap();
    assert!(!need_restart);

    // 启用时再次检查
    let mut enabling = disabled.clone();
    enabling.enable = true;
    let err = store.update_inbound(idle.id, &enabling).await.unwrap_err();
    assert!(err.is_conflict());

    assert_eq!(store.get_all_inbounds().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_draft_is_rejected_before_persistence() {
    let (store, live, _) = setup().await;

    let err = store.add_inbound(&draft(1, 0)).await.unwrap_err();
    assert!(err.is_validation());
    let err = store.add_inbound(&draft(1, 70000)).await.unwrap_err();
    assert!(err.is_validation());

    let mut bad_protocol = draft(1, 443);
    bad_protocol.protocol = "carrier-pigeon".to_string();
    assert!(store.add_inbound(&bad_protocol).await.unwrap_err().is_validation());

    let mut bad_settings = draft(1, 443);
    bad_settings.settings = vless_settings(&[(ALICE_ID, "a"), (BOB_ID, "A")]);
    assert!(store.add_inbound(&bad_settings).await.unwrap_err().is_validation());

    let mut bad_stream = draft(1, 443);
    bad_stream.stream_settings = "[]".to_string();
    assert!(store.add_inbound(&bad_stream).await.unwrap_err().is_validation());

    assert!(store.get_all_inbounds().await.unwrap().is_empty());
    assert!(live.calls().is_empty());
}

#[tokio::test]
async fn test_tag_generation_and_uniqueness() {
    let (store, live, _) = setup().await;
    let (first, need_restart) = store.add_inbound(&draft(1, 443)).await.unwrap();
    assert!(!need_restart);
    assert!(first.tag.starts_with("inbound-443-"));
    assert_eq!(live.calls(), vec![LiveCall::AddInbound(first.tag.clone())]);

    let mut named = draft(1, 8443);
    named.tag = Some("Edge".to_string());
    store.add_inbound(&named).await.unwrap();

    let mut clash = draft(1, 9443);
    clash.tag = Some("edge".to_string());
    assert!(store.add_inbound(&clash).await.unwrap_err().is_conflict());
}

#[tokio::test]
async fn test_total_is_up_plus_down_and_counters_start_at_zero() {
    let (store, _, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    assert_eq!((model.up, model.down, model.total), (0, 0, 0));

    let rows = store.get_client_traffics(model.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].email, "alice");
    assert!(rows[0].enable);
}

#[tokio::test]
async fn test_get_inbounds_filters_by_owner() {
    let (store, _, _) = setup().await;
    store.add_inbound(&draft(1, 1001)).await.unwrap();
    store.add_inbound(&draft(1, 1002)).await.unwrap();
    store.add_inbound(&draft(2, 1003)).await.unwrap();

    let first = store.get_inbounds(1).await.unwrap();
    let second = store.get_inbounds(2).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(first.iter().all(|i| i.user_id == 1));
    assert!(second.iter().all(|i| i.user_id == 2));
    assert!(store.get_inbounds(3).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let (store, live, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    live.clear();

    let need_restart = store.del_inbound(model.id).await.unwrap();
    assert!(!need_restart);
    assert_eq!(live.calls(), vec![LiveCall::RemoveInbound(model.tag.clone())]);

    assert!(store.get_inbound(model.id).await.unwrap_err().is_not_found());
    assert!(store.del_inbound(model.id).await.unwrap_err().is_not_found());
    assert!(store.get_client_traffics(model.id).await.unwrap().is_empty());

    // 端口已释放
    store.add_inbound(&draft(1, 443)).await.unwrap();
}

#[tokio::test]
async fn test_live_failure_turns_into_need_restart() {
    let (store, live, _) = setup().await;
    live.set_failing(true);

    let (model, need_restart) = store.add_inbound(&draft(1, 443)).await.unwrap();
    assert!(need_restart);
    // 数据已提交，不回滚
    assert_eq!(store.get_inbound(model.id).await.unwrap().tag, model.tag);

    let (_, need_restart) = store
        .add_inbound_client(model.id, new_client("bob"))
        .await
        .unwrap();
    assert!(need_restart);
    assert_eq!(store.get_clients(model.id).await.unwrap().clients().len(), 2);

    assert!(store.del_inbound(model.id).await.unwrap());
    assert!(store.get_inbound(model.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_single_client_add_is_hot() {
    let (store, live, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    live.clear();

    let (client, need_restart) = store
        .add_inbound_client(model.id, new_client("bob"))
        .await
        .unwrap();
    assert!(!need_restart);
    assert_eq!(client.email, "bob");
    assert_eq!(
        live.calls(),
        vec![LiveCall::AddUser {
            tag: model.tag.clone(),
            email: "bob".to_string()
        }]
    );
    assert_eq!(store.get_client_traffics(model.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_port_change_needs_restart() {
    let (store, live, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    live.clear();

    let mut moved = draft(1, 8443);
    moved.tag = Some(model.tag.clone());
    let (updated, need_restart) = store.update_inbound(model.id, &moved).await.unwrap();
    assert!(need_restart);
    assert_eq!(updated.port, 8443);
    assert!(live.calls().is_empty());
}

#[tokio::test]
async fn test_clients_only_update_is_hot() {
    let (store, live, _) = setup().await;
    let mut initial = draft(1, 443);
    initial.settings = vless_settings(&[(ALICE_ID, "alice"), (BOB_ID, "bob")]);
    let (model, _) = store.add_inbound(&initial).await.unwrap();
    live.clear();

    let carol_id = uuid::Uuid::new_v4().to_string();
    let mut edited = initial.clone();
    edited.settings = vless_settings(&[(ALICE_ID, "alice"), (carol_id.as_str(), "carol")]);
    let (updated, need_restart) = store.update_inbound(model.id, &edited).await.unwrap();
    assert!(!need_restart);
    // 未指定 tag 时沿用原 tag
    assert_eq!(updated.tag, model.tag);
    assert_eq!(
        live.calls(),
        vec![
            LiveCall::RemoveUser {
                tag: model.tag.clone(),
                email: "bob".to_string()
            },
            LiveCall::AddUser {
                tag: model.tag.clone(),
                email: "carol".to_string()
            },
        ]
    );

    let emails: Vec<String> = store
        .get_client_traffics(model.id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.email)
        .collect();
    assert_eq!(emails, vec!["alice", "carol"]);
}

#[tokio::test]
async fn test_enable_toggle() {
    let (store, live, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    live.clear();

    let mut off = draft(1, 443);
    off.enable = false;
    let (_, need_restart) = store.update_inbound(model.id, &off).await.unwrap();
    assert!(!need_restart);
    assert_eq!(live.calls(), vec![LiveCall::RemoveInbound(model.tag.clone())]);

    let (_, need_restart) = store.update_inbound(model.id, &draft(1, 443)).await.unwrap();
    assert!(need_restart);
}

#[tokio::test]
async fn test_client_label_uniqueness() {
    let (store, _, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();

    let err = store
        .add_inbound_client(model.id, new_client("ALICE"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    store.del_inbound_client(model.id, "Alice").await.unwrap();
    store
        .add_inbound_client(model.id, new_client("alice"))
        .await
        .unwrap();

    let set = store.get_clients(model.id).await.unwrap();
    assert_eq!(set.labels(), vec!["alice"]);
}

#[tokio::test]
async fn test_update_and_delete_missing_client() {
    let (store, _, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();

    let err = store
        .update_inbound_client(model.id, "nobody", &ClientPatch::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(store
        .del_inbound_client(model.id, "nobody")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .add_inbound_client(999, new_client("x"))
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_update_client_reapplies_user() {
    let (store, live, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    live.clear();

    let patch = ClientPatch {
        email: Some("alice2".to_string()),
        total_gb: Some(1024),
        ..Default::default()
    };
    let (client, need_restart) = store
        .update_inbound_client(model.id, "alice", &patch)
        .await
        .unwrap();
    assert!(!need_restart);
    assert_eq!(client.email, "alice2");
    assert_eq!(client.id.as_deref(), Some(ALICE_ID));
    assert_eq!(
        live.calls(),
        vec![
            LiveCall::RemoveUser {
                tag: model.tag.clone(),
                email: "alice".to_string()
            },
            LiveCall::AddUser {
                tag: model.tag.clone(),
                email: "alice2".to_string()
            },
        ]
    );

    let rows = store.get_client_traffics(model.id).await.unwrap();
    assert_eq!(rows[0].email, "alice2");
    assert_eq!(rows[0].traffic_limit, 1024);
}

#[tokio::test]
async fn test_get_clients_is_cached_and_invalidated() {
    let (store, _, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();

    let first = store.get_clients(model.id).await.unwrap();
    let second = store.get_clients(model.id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    store
        .add_inbound_client(model.id, new_client("bob"))
        .await
        .unwrap();
    let third = store.get_clients(model.id).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(third.labels(), vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_reset_client_traffic_revives_depleted_client() {
    let (store, live, db) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();

    let row = store.get_client_traffics(model.id).await.unwrap().remove(0);
    let mut active: client_traffic::ActiveModel = row.into();
    active.up = Set(600);
    active.down = Set(400);
    active.total = Set(1000);
    active.enable = Set(false);
    active.update(db.conn()).await.unwrap();
    live.clear();

    let need_restart = store.reset_client_traffic(model.id, "ALICE").await.unwrap();
    assert!(!need_restart);
    assert_eq!(
        live.calls(),
        vec![LiveCall::AddUser {
            tag: model.tag.clone(),
            email: "alice".to_string()
        }]
    );

    let row = store.get_client_traffics(model.id).await.unwrap().remove(0);
    assert_eq!((row.up, row.down, row.total), (0, 0, 0));
    assert!(row.enable);

    assert!(store
        .reset_client_traffic(model.id, "nobody")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_reset_all_traffics() {
    let (store, _, db) = setup().await;
    let (a, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    let (b, _) = store.add_inbound(&draft(1, 8443)).await.unwrap();

    for model in [a.clone(), b.clone()] {
        let mut active: inbound::ActiveModel = model.into();
        active.up = Set(10);
        active.down = Set(20);
        active.total = Set(30);
        active.all_time = Set(30);
        active.update(db.conn()).await.unwrap();
    }

    store.reset_all_traffics().await.unwrap();
    for id in [a.id, b.id] {
        let model = store.get_inbound(id).await.unwrap();
        assert_eq!((model.up, model.down, model.total), (0, 0, 0));
        assert_eq!(model.all_time, 30);
    }

    assert!(store.reset_all_client_traffics(ALL_INBOUNDS).await.is_ok());
    assert!(store
        .reset_all_client_traffics(4242)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_live_inbound_configs_skip_disabled_and_depleted() {
    let (store, _, db) = setup().await;
    let mut with_two = draft(1, 443);
    with_two.settings = vless_settings(&[(ALICE_ID, "alice"), (BOB_ID, "bob")]);
    let (model, _) = store.add_inbound(&with_two).await.unwrap();

    let mut off = draft(1, 8443);
    off.enable = false;
    store.add_inbound(&off).await.unwrap();

    let bob = store
        .get_client_traffics(model.id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.email == "bob")
        .unwrap();
    let mut active: client_traffic::ActiveModel = bob.into();
    active.enable = Set(false);
    active.update(db.conn()).await.unwrap();

    let configs = store.live_inbound_configs().await.unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].tag, model.tag);
    assert_eq!(configs[0].port, 443);
    let clients = configs[0].settings["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["email"], "alice");
    assert_eq!(configs[0].stream_settings["network"], "tcp");
}

async fn set_client_usage(store: &ConfigStore, db: &Datastore, inbound_id: i64, email: &str, used: i64, enable: bool) {
    let row = store
        .get_client_traffics(inbound_id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.email == email)
        .unwrap();
    let mut active: client_traffic::ActiveModel = row.into();
    active.up = Set(used);
    active.down = Set(0);
    active.total = Set(used);
    active.enable = Set(enable);
    active.update(db.conn()).await.unwrap();
}

fn alice_settings(extra: Value) -> String {
    let mut alice = serde_json::json!({"id": ALICE_ID, "email": "alice"});
    if let (Value::Object(target), Value::Object(fields)) = (&mut alice, extra) {
        target.extend(fields);
    }
    serde_json::json!({"clients": [alice], "decryption": "none"}).to_string()
}

#[tokio::test]
async fn test_disabling_client_in_settings_removes_user() {
    let (store, live, _) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    live.clear();

    let mut edited = draft(1, 443);
    edited.settings = alice_settings(serde_json::json!({"enable": false}));
    let (_, need_restart) = store.update_inbound(model.id, &edited).await.unwrap();

    assert!(!need_restart);
    assert_eq!(
        live.calls(),
        vec![LiveCall::RemoveUser {
            tag: model.tag.clone(),
            email: "alice".to_string()
        }]
    );
    assert!(!store.get_client_traffics(model.id).await.unwrap()[0].enable);
}

#[tokio::test]
async fn test_lowering_limit_below_usage_removes_user() {
    let (store, live, db) = setup().await;
    let (model, _) = store.add_inbound(&draft(1, 443)).await.unwrap();
    set_client_usage(&store, &db, model.id, "alice", 1000, true).await;
    live.clear();

    let mut edited = draft(1, 443);
    edited.settings = alice_settings(serde_json::json!({"totalGB": 500}));
    let (_, need_restart) = store.update_inbound(model.id, &edited).await.unwrap();

    assert!(!need_restart);
    // 额度已耗尽，只移除不再添加
    assert_eq!(
        live.calls(),
        vec![LiveCall::RemoveUser {
            tag: model.tag.clone(),
            email: "alice".to_string()
        }]
    );
    assert!(!store.get_client_traffics(model.id).await.unwrap()[0].enable);
}

#[tokio::test]
async fn test_raising_limit_of_depleted_client_only_adds_user() {
    let (store, live, db) = setup().await;
    let mut capped = draft(1, 443);
    capped.settings = alice_settings(serde_json::json!({"totalGB": 500}));
    let (model, _) = store.add_inbound(&capped).await.unwrap();
    set_client_usage(&store, &db, model.id, "alice", 1000, false).await;
    live.clear();

    let mut raised = draft(1, 443);
    raised.settings = alice_settings(serde_json::json!({"totalGB": 5000}));
    let (_, need_restart) = store.update_inbound(model.id, &raised).await.unwrap();

    assert!(!need_restart);
    // 代理侧早已没有这个用户，不应再发送移除
    assert_eq!(
        live.calls(),
        vec![LiveCall::AddUser {
            tag: model.tag.clone(),
            email: "alice".to_string()
        }]
    );
    assert!(store.get_client_traffics(model.id).await.unwrap()[0].enable);
}

#[tokio::test]
async fn test_concurrent_adds_on_same_port_admit_one() {
    let (store, _, _) = setup().await;
    let first = draft(1, 443);
    let second = draft(2, 443);

    let (a, b) = tokio::join!(store.add_inbound(&first), store.add_inbound(&second));

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(loser.is_conflict());
    assert_eq!(store.get_all_inbounds().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unique_index_violation_maps_to_conflict() {
    let (store, _, db) = setup().await;
    let (existing, _) = store.add_inbound(&draft(1, 443)).await.unwrap();

    // 绕过服务层的检查，直接触发数据库唯一索引
    let now = Utc::now().naive_utc();
    let duplicate = |tag: &str, port: i32| inbound::ActiveModel {
        id: NotSet,
        user_id: Set(1),
        up: Set(0),
        down: Set(0),
        total: Set(0),
        all_time: Set(0),
        remark: Set(String::new()),
        enable: Set(true),
        expiry_time: Set(None),
        traffic_limit: Set(None),
        listen: Set(String::new()),
        port: Set(port),
        protocol: Set(Protocol::Vless),
        settings: Set(vless_settings(&[])),
        stream_settings: Set("{}".to_string()),
        tag: Set(tag.to_string()),
        sniffing: Set("{}".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let err = duplicate("other", 443).insert(db.conn()).await.unwrap_err();
    assert!(ServiceError::from(err).is_conflict());

    let err = duplicate(&existing.tag.to_uppercase(), 8443)
        .insert(db.conn())
        .await
        .unwrap_err();
    assert!(ServiceError::from(err).is_conflict());
}

#[tokio::test]
async fn test_unset_expiry_and_limit_are_stored_as_null() {
    let (store, _, _) = setup().await;
    let (open_ended, _) = store.add_inbound(&draft(1, 443)).await.unwrap();

    let mut bounded = draft(1, 8443);
    bounded.expiry_time = Some(1_900_000_000_000);
    bounded.traffic_limit = Some(1 << 30);
    let (bounded, _) = store.add_inbound(&bounded).await.unwrap();

    let open_ended = store.get_inbound(open_ended.id).await.unwrap();
    assert_eq!((open_ended.expiry_time, open_ended.traffic_limit), (None, None));
    let bounded = store.get_inbound(bounded.id).await.unwrap();
    assert_eq!(bounded.expiry_time, Some(1_900_000_000_000));
    assert_eq!(bounded.traffic_limit, Some(1 << 30));
}
