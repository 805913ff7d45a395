mod common;

use std::time::Duration;

use async_trait::async_trait;
use bson::{Document, doc, oid::ObjectId};
use docmodel::{
    executor::{DocumentStream, WriteAck},
    prelude::*,
};
use futures::future;

use common::{create_post, create_user, registry, setup};

fn author(post: &Model) -> &ReferenceHandle {
    post.get("author")
        .and_then(Value::as_reference)
        .expect("author reference")
}

#[tokio::test]
async fn test_one_fetch_per_schema_per_level() {
    let (ctx, executor) = setup().await;

    let mut users = Vec::new();
    for index in 0..4 {
        users.push(create_user(&ctx, &format!("user{index}"), 20 + index).await);
    }
    for index in 0..10 {
        let mut post = create_post(&ctx, &format!("post{index}"), &users[index % 4]).await;
        post.set("editors", vec![&users[(index + 1) % 4], &users[(index + 2) % 4]])
            .expect("editors");
        post.save(&ctx).await.expect("saved");
    }

    let mut posts = ctx.objects("Post").expect("queryset").all().await.expect("posts");
    assert_eq!(posts.len(), 10);
    assert!(posts.iter().all(|post| !author(post).is_resolved()));

    executor.clear_find_log().await;
    let report = ctx.dereference(&mut posts, 1).await.expect("dereferenced");

    let log = executor.find_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].collection, "user");
    assert_eq!(report.queries, 1);
    assert_eq!(report.resolved, 30);
    assert_eq!(report.dangling, 0);

    for post in &posts {
        let resolved = author(post).as_model().expect("resolved author");
        assert!(resolved.get("name").and_then(Value::as_str).is_some_and(|name| name.starts_with("user")));

        let editors = post.get("editors").and_then(Value::as_list).expect("editors");
        assert!(editors.iter().all(|editor| editor.as_reference().is_some_and(ReferenceHandle::is_resolved)));
    }

    // Resolving does not count as a change.
    assert!(posts.iter().all(|post| post.delta().expect("delta").is_empty()));
}

#[tokio::test]
async fn test_missing_targets_become_dangling() {
    let (ctx, _executor) = setup().await;

    let alice = create_user(&ctx, "Alice", 30).await;
    let bob = create_user(&ctx, "Bob", 40).await;
    create_post(&ctx, "kept", &alice).await;
    create_post(&ctx, "orphaned", &bob).await;
    bob.delete(&ctx).await.expect("deleted");

    let posts = ctx
        .objects("Post")
        .expect("queryset")
        .order_by(["title"])
        .select_related(1)
        .all()
        .await
        .expect("posts");

    assert!(author(&posts[0]).is_resolved());
    assert!(author(&posts[1]).is_dangling());
    assert_eq!(author(&posts[1]).id(), bob.id());
}

#[tokio::test]
async fn test_depth_bounds_resolution() {
    let (ctx, executor) = setup().await;

    let alice = create_user(&ctx, "Alice", 30).await;
    let post = create_post(&ctx, "hello", &alice).await;

    let mut comment = ctx.create("Comment").expect("comment");
    comment.set("post", &post).expect("post");
    comment.set("body", "nice").expect("body");
    comment.save(&ctx).await.expect("saved");

    let mut shallow = ctx.objects("Comment").expect("queryset").all().await.expect("comments");
    ctx.dereference(&mut shallow, 1).await.expect("depth 1");
    let shallow_post = shallow[0]
        .get("post")
        .and_then(Value::as_reference)
        .and_then(ReferenceHandle::as_model)
        .expect("post resolved");
    assert!(!author(shallow_post).is_resolved());

    executor.clear_find_log().await;
    let mut deep = ctx.objects("Comment").expect("queryset").all().await.expect("comments");
    let report = ctx.dereference(&mut deep, 2).await.expect("depth 2");
    assert_eq!(report.levels, 2);
    assert_eq!(report.queries, 2);

    let deep_post = deep[0]
        .get("post")
        .and_then(Value::as_reference)
        .and_then(ReferenceHandle::as_model)
        .expect("post resolved");
    assert!(author(deep_post).is_resolved());

    let collections: Vec<String> = executor
        .find_log()
        .await
        .into_iter()
        .map(|record| record.collection)
        .collect();
    assert_eq!(collections, ["comment", "post", "user"]);
}

#[tokio::test]
async fn test_second_call_goes_deeper() {
    let (ctx, executor) = setup().await;

    let alice = create_user(&ctx, "Alice", 30).await;
    let post = create_post(&ctx, "hello", &alice).await;

    let mut comment = ctx.create("Comment").expect("comment");
    comment.set("post", &post).expect("post");
    comment.save(&ctx).await.expect("saved");

    let mut comments = ctx.objects("Comment").expect("queryset").all().await.expect("comments");
    let report = ctx.dereference(&mut comments, 1).await.expect("depth 1");
    assert_eq!(report.queries, 1);

    executor.clear_find_log().await;
    let report = ctx.dereference(&mut comments, 2).await.expect("depth 2");
    assert_eq!(report.levels, 1);
    assert_eq!(report.queries, 1);
    assert_eq!(report.resolved, 1);

    let log = executor.find_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].collection, "user");

    let resolved_post = comments[0]
        .get("post")
        .and_then(Value::as_reference)
        .and_then(ReferenceHandle::as_model)
        .expect("post resolved");
    assert!(author(resolved_post).is_resolved());

    // Depth already satisfied.
    executor.clear_find_log().await;
    let report = ctx.dereference(&mut comments, 2).await.expect("depth 2 again");
    assert_eq!(report, DereferenceReport::default());
    assert_eq!(executor.find_count().await, 0);
}

#[tokio::test]
async fn test_schemas_sharing_a_collection_share_a_query() {
    let member = Schema::builder("Member")
        .collection("members")
        .strictness(Strictness::Retain)
        .field(FieldSpec::string("name"))
        .build()
        .expect("member schema");
    let admin = Schema::builder("Admin")
        .extends(&member)
        .field(FieldSpec::int("level"))
        .build()
        .expect("admin schema");
    let team = Schema::builder("Team")
        .field(FieldSpec::reference("lead", "Admin"))
        .field(FieldSpec::list("members", FieldSpec::reference("member", "Member")))
        .build()
        .expect("team schema");
    let registry = SchemaRegistry::builder()
        .register(member)
        .register(admin)
        .register(team)
        .build()
        .expect("registry");

    let executor = docmodel::memory::InMemoryExecutor::new();
    let ctx = Context::new(executor.clone(), registry);

    let mut lead = ctx.create("Admin").expect("admin");
    lead.set("name", "Ada").expect("name");
    lead.set("level", 3).expect("level");
    lead.save(&ctx).await.expect("saved");

    let mut crew = ctx.create("Member").expect("member");
    crew.set("name", "Bo").expect("name");
    crew.save(&ctx).await.expect("saved");

    let mut team = ctx.create("Team").expect("team");
    team.set("lead", &lead).expect("lead");
    team.set("members", vec![&crew, &lead]).expect("members");
    team.save(&ctx).await.expect("saved");

    let mut teams = ctx.objects("Team").expect("queryset").all().await.expect("teams");
    executor.clear_find_log().await;
    let report = ctx.dereference(&mut teams, 1).await.expect("dereferenced");

    let log = executor.find_log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].collection, "members");
    assert_eq!(report.queries, 1);
    assert_eq!(report.resolved, 3);
    assert_eq!(report.dangling, 0);

    let resolved_lead = teams[0]
        .get("lead")
        .and_then(Value::as_reference)
        .and_then(ReferenceHandle::as_model)
        .expect("lead resolved");
    assert_eq!(resolved_lead.schema().name(), "Admin");
    assert_eq!(resolved_lead.get("level").and_then(Value::as_i64), Some(3));
}

#[tokio::test]
async fn test_nothing_to_resolve_issues_no_query() {
    let (ctx, executor) = setup().await;
    create_user(&ctx, "Alice", 30).await;

    let mut users = ctx.objects("User").expect("queryset").all().await.expect("users");
    executor.clear_find_log().await;

    let report = ctx.dereference(&mut users, 3).await.expect("dereferenced");
    assert_eq!(report, DereferenceReport::default());
    assert_eq!(executor.find_count().await, 0);
}

/// Never answers a find.
#[derive(Debug)]
struct StalledExecutor;

#[async_trait]
impl QueryExecutor for StalledExecutor {
    async fn execute_find(&self, _collection: &str, _spec: FindSpec) -> OdmResult<DocumentStream> {
        future::pending().await
    }

    async fn execute_write(&self, _collection: &str, _op: WriteOp) -> OdmResult<WriteAck> {
        Ok(WriteAck::default())
    }
}

#[tokio::test]
async fn test_interrupted_dereference() {
    let registry = registry();
    let ctx = Context::new(StalledExecutor, registry.clone());

    let stored: Document = doc! {
        "_id": ObjectId::new(),
        "t": "stalled",
        "author": { "$ref": "user", "$id": ObjectId::new() },
    };
    let mut posts = vec![Model::from_wire(&registry, "Post", stored).expect("post")];

    let engine = DereferenceEngine::new(&ctx, 1);
    let err = engine
        .dereference_until(&mut posts, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Interrupt::Timeout
        })
        .await
        .expect_err("timed out");
    assert!(matches!(err, OdmError::Timeout(_)));

    let err = engine
        .dereference_until(&mut posts, future::ready(Interrupt::Cancelled))
        .await
        .expect_err("cancelled");
    assert!(matches!(err, OdmError::Cancelled(_)));

    assert!(!author(&posts[0]).is_resolved());
    assert!(!author(&posts[0]).is_dangling());
}
