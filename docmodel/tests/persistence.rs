mod common;

use bson::{Bson, doc};
use docmodel::prelude::*;

use common::{create_user, setup};

#[tokio::test]
async fn test_insert_and_unchanged_save() {
    let (ctx, executor) = setup().await;

    let mut alice = ctx.create("User").expect("user");
    assert!(alice.is_new());
    alice.set("name", "Alice").expect("name");
    alice.set("age", 30).expect("age");

    assert_eq!(alice.save(&ctx).await.expect("insert"), SaveOutcome::Inserted);
    assert!(!alice.is_new());

    let stored = executor.documents("user").await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("n").expect("wire name"), "Alice");
    assert_eq!(Some(stored[0].get("_id").cloned().expect("id")), alice.id());

    // Saving again without mutation must not reach the store.
    assert_eq!(alice.save(&ctx).await.expect("noop"), SaveOutcome::Unchanged);

    let mut loaded = ctx.objects("User").expect("queryset").get().await.expect("loaded");
    assert!(loaded.delta().expect("delta").is_empty());
    assert_eq!(loaded.save(&ctx).await.expect("noop"), SaveOutcome::Unchanged);
}

#[tokio::test]
async fn test_save_sends_minimal_delta() {
    let (ctx, executor) = setup().await;
    let alice = create_user(&ctx, "Alice", 30).await;

    let mut loaded = ctx
        .objects("User")
        .expect("queryset")
        .filter(Q::new("pk", alice.pk().cloned().expect("pk")))
        .get()
        .await
        .expect("loaded");

    loaded.set("age", 5).expect("age");
    assert_eq!(loaded.delta().expect("delta").to_update_document(), doc! { "$set": { "age": 5 } });

    loaded.unset("age").expect("unset");
    assert_eq!(loaded.delta().expect("delta").to_update_document(), doc! { "$unset": { "age": "" } });

    loaded.set("age", 31).expect("age");
    assert_eq!(loaded.save(&ctx).await.expect("update"), SaveOutcome::Updated);
    assert!(loaded.delta().expect("delta").is_empty());

    let stored = executor.documents("user").await;
    assert_eq!(stored[0].get("age"), Some(&Bson::Int32(31)));
    assert_eq!(stored[0].get_str("n").expect("name kept"), "Alice");
}

#[tokio::test]
async fn test_append_replaces_whole_list() {
    let (ctx, executor) = setup().await;
    let mut alice = create_user(&ctx, "Alice", 30).await;

    alice.set("tags", vec!["rust"]).expect("tags");
    alice.save(&ctx).await.expect("saved");

    alice.append("tags", "async").expect("append");
    assert_eq!(
        alice.delta().expect("delta").to_update_document(),
        doc! { "$set": { "tags": ["rust", "async"] } }
    );
    alice.save(&ctx).await.expect("saved");

    let stored = executor.documents("user").await;
    assert_eq!(stored[0].get_array("tags").expect("tags").len(), 2);
}

#[tokio::test]
async fn test_conditional_save() {
    let (ctx, executor) = setup().await;
    let mut alice = create_user(&ctx, "Alice", 30).await;

    alice.set("age", 40).expect("age");
    let err = alice
        .save_with(&ctx, SaveOptions::new().condition(Q::new("age", 99)))
        .await
        .expect_err("condition does not match");
    assert!(matches!(err, OdmError::NotSaved { .. }));
    assert_eq!(executor.documents("user").await[0].get("age"), Some(&Bson::Int32(30)));

    let outcome = alice
        .save_with(&ctx, SaveOptions::new().condition(Q::new("age__lt", 35)))
        .await
        .expect("condition matches");
    assert_eq!(outcome, SaveOutcome::Updated);
    assert_eq!(executor.documents("user").await[0].get("age"), Some(&Bson::Int32(40)));
}

#[tokio::test]
async fn test_validation_blocks_writes() {
    let (ctx, executor) = setup().await;

    let mut nameless = ctx.create("User").expect("user");
    nameless.set("age", -1).expect("age");

    let err = nameless.save(&ctx).await.expect_err("invalid");
    let OdmError::Validation(errors) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert!(errors.get("name").is_some());
    assert!(errors.get("age").is_some());
    assert!(executor.documents("user").await.is_empty());

    let outcome = nameless
        .save_with(&ctx, SaveOptions::new().skip_validation())
        .await
        .expect("unvalidated insert");
    assert_eq!(outcome, SaveOutcome::Inserted);
}

#[tokio::test]
async fn test_unique_constraint() {
    let (ctx, _executor) = setup().await;

    let mut first = ctx.create("User").expect("user");
    first.set("name", "Alice").expect("name");
    first.set("email", "alice@example.com").expect("email");
    first.save(&ctx).await.expect("first");

    let mut second = ctx.create("User").expect("user");
    second.set("name", "Alicia").expect("name");
    second.set("email", "alice@example.com").expect("email");

    let err = second.save(&ctx).await.expect_err("duplicate");
    assert!(matches!(err, OdmError::NotUnique { .. }));
    assert!(second.is_new());
}

#[tokio::test]
async fn test_delete_and_reload() {
    let (ctx, executor) = setup().await;
    let mut alice = create_user(&ctx, "Alice", 30).await;

    let mut other = ctx.objects("User").expect("queryset").get().await.expect("loaded");
    other.set("age", 50).expect("age");
    other.save(&ctx).await.expect("saved");

    alice.set("name", "Unsaved").expect("name");
    alice.reload(&ctx).await.expect("reloaded");
    assert_eq!(alice.get("name").and_then(Value::as_str), Some("Alice"));
    assert_eq!(alice.get("age").and_then(Value::as_i64), Some(50));
    assert!(alice.delta().expect("delta").is_empty());

    alice.delete(&ctx).await.expect("deleted");
    assert!(executor.documents("user").await.is_empty());

    let err = alice.reload(&ctx).await.expect_err("gone");
    assert!(matches!(err, OdmError::DoesNotExist { .. }));
}

#[tokio::test]
async fn test_embedded_paths_use_wire_names() {
    let (ctx, executor) = setup().await;
    let mut alice = create_user(&ctx, "Alice", 30).await;

    alice.set_path("address.city", "Paris").expect("city");
    alice.save(&ctx).await.expect("saved");

    let stored = executor.documents("user").await;
    assert_eq!(
        stored[0].get_document("address").expect("address"),
        &doc! { "c": "Paris" }
    );

    let found = ctx
        .objects("User")
        .expect("queryset")
        .filter(Q::new("address__city", "Paris"))
        .count()
        .await
        .expect("count");
    assert_eq!(found, 1);
}

#[tokio::test]
async fn test_integral_float_honours_range() {
    let (ctx, executor) = setup().await;

    let mut user = ctx.create("User").expect("user");
    user.set("name", "Alice").expect("name");
    user.set("age", Value::Float(-4.0)).expect("age");

    let errors = user.validate().expect_err("below minimum");
    assert!(errors.get("age").is_some());
    assert!(matches!(user.to_wire(), Err(OdmError::Validation(_))));
    assert!(matches!(user.save(&ctx).await, Err(OdmError::Validation(_))));
    assert!(executor.documents("user").await.is_empty());

    user.set("age", Value::Float(42.0)).expect("age");
    assert_eq!(user.save(&ctx).await.expect("saved"), SaveOutcome::Inserted);
    assert_eq!(executor.documents("user").await[0].get("age"), Some(&Bson::Int32(42)));
}

#[tokio::test]
async fn test_rejected_path_leaves_document_untouched() {
    let (ctx, _executor) = setup().await;
    let mut alice = create_user(&ctx, "Alice", 30).await;

    let err = alice.set_path("address.country", "FR").expect_err("undeclared");
    assert!(matches!(err, OdmError::UnknownField { .. }));
    assert!(alice.get("address").is_none());

    let err = alice.set_path("tags.3", "late").expect_err("out of range");
    assert!(matches!(err, OdmError::InvalidPath { .. }));
    assert!(alice.get("tags").is_none());

    assert!(alice.validate().is_ok());
    assert!(alice.delta().expect("delta").is_empty());
    assert_eq!(alice.save(&ctx).await.expect("noop"), SaveOutcome::Unchanged);

    alice.set_path("address.city", "Paris").expect("city");
    assert_eq!(alice.get_path("address.city").and_then(Value::as_str), Some("Paris"));
}

#[tokio::test]
async fn test_save_after_projected_load() {
    let (ctx, executor) = setup().await;

    let mut alice = ctx.create("User").expect("user");
    alice.set("name", "Alice").expect("name");
    alice
        .set("address", Value::embedded([("city", "Paris"), ("zip", "75001")]))
        .expect("address");
    alice.save(&ctx).await.expect("saved");

    let mut partial = ctx
        .objects("User")
        .expect("queryset")
        .only(["name", "address__zip"])
        .get()
        .await
        .expect("partial");
    assert!(partial.get_path("address.city").is_none());
    assert!(partial.validate().is_ok());

    partial.set("name", "Alicia").expect("name");
    assert_eq!(partial.save(&ctx).await.expect("saved"), SaveOutcome::Updated);

    partial.set_path("address.zip", "75002").expect("zip");
    assert_eq!(
        partial.delta().expect("delta").to_update_document(),
        doc! { "$set": { "address.zip": "75002" } }
    );
    partial.save(&ctx).await.expect("saved");

    let stored = executor.documents("user").await;
    assert_eq!(stored[0].get_str("n").expect("name"), "Alicia");
    assert_eq!(
        stored[0].get_document("address").expect("address"),
        &doc! { "c": "Paris", "zip": "75002" }
    );
}

#[tokio::test]
async fn test_datetime_round_trip() {
    let (ctx, executor) = setup().await;
    let joined = bson::DateTime::from_millis(1_700_000_000_123).to_chrono();

    let mut alice = ctx.create("User").expect("user");
    alice.set("name", "Alice").expect("name");
    alice.set("joined", joined).expect("joined");
    alice.save(&ctx).await.expect("saved");

    let stored = executor.documents("user").await;
    assert_eq!(
        stored[0].get("joined"),
        Some(&Bson::DateTime(bson::DateTime::from_millis(1_700_000_000_123)))
    );

    let loaded = ctx.objects("User").expect("queryset").get().await.expect("loaded");
    assert_eq!(loaded.get("joined"), Some(&Value::DateTime(joined)));
    assert!(loaded.delta().expect("delta").is_empty());
}
