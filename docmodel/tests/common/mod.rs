#![allow(dead_code)]

use std::sync::Arc;

use docmodel::{executor::ExecutorBuilder, memory::InMemoryExecutor, prelude::*};

/// User, Post and Comment collections plus the embedded Address.
pub fn registry() -> Arc<SchemaRegistry> {
    let address = Schema::embedded("Address")
        .field(FieldSpec::string("city").required().wire_name("c"))
        .field(FieldSpec::string("zip"))
        .build()
        .expect("address schema");

    let user = Schema::builder("User")
        .field(FieldSpec::string("name").required().max_length(64).wire_name("n"))
        .field(FieldSpec::string("email").unique())
        .field(FieldSpec::int("age").min_value(0))
        .field(FieldSpec::list("tags", FieldSpec::string("tag")))
        .field(FieldSpec::embedded("address", "Address"))
        .field(FieldSpec::datetime("joined"))
        .build()
        .expect("user schema");

    let post = Schema::builder("Post")
        .field(FieldSpec::string("title").required().wire_name("t"))
        .field(FieldSpec::reference("author", "User"))
        .field(FieldSpec::list("editors", FieldSpec::reference("editor", "User")))
        .field(FieldSpec::int("views").default(0))
        .build()
        .expect("post schema");

    let comment = Schema::builder("Comment")
        .field(FieldSpec::reference("post", "Post").required())
        .field(FieldSpec::string("body"))
        .build()
        .expect("comment schema");

    SchemaRegistry::builder()
        .register(address)
        .register(user)
        .register(post)
        .register(comment)
        .build()
        .expect("registry")
}

/// A context over a fresh in-memory executor, plus a handle on the executor
/// for inspecting stored documents and served finds.
pub async fn setup() -> (Context, InMemoryExecutor) {
    let registry = registry();
    let executor = InMemoryExecutor::builder()
        .unique_from_registry(&registry)
        .build()
        .await
        .expect("executor");

    (Context::new(executor.clone(), registry), executor)
}

pub async fn create_user(ctx: &Context, name: &str, age: i64) -> Model {
    let mut user = ctx.create("User").expect("user");
    user.set("name", name).expect("name");
    user.set("age", age).expect("age");
    user.save(ctx).await.expect("user saved");
    user
}

pub async fn create_post(ctx: &Context, title: &str, author: &Model) -> Model {
    let mut post = ctx.create("Post").expect("post");
    post.set("title", title).expect("title");
    post.set("author", author).expect("author");
    post.save(ctx).await.expect("post saved");
    post
}
