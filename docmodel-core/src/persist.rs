//! Saving, deleting and reloading documents.

use bson::{Bson, Document};
use tracing::debug;

use crate::{
    context::Context,
    delta::and_filters,
    document::Model,
    error::{OdmError, OdmResult},
    executor::WriteOp,
    query::{FilterCompiler, Q},
    queryset::pk_filter,
    value::Value,
};

/// Options for [`Model::save_with`].
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Extra constraint the stored document must match for an update to
    /// apply. Ignored on insert.
    pub condition: Option<Q>,
    /// Run validation before writing.
    pub validate: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            condition: None,
            validate: true,
        }
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(mut self, condition: Q) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn skip_validation(mut self) -> Self {
        self.validate = false;
        self
    }
}

/// What a save did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    Updated,
    /// Nothing had changed; the store was not contacted.
    Unchanged,
}

impl Model {
    /// Validates and writes the document: a full insert for new documents, the
    /// minimal `$set`/`$unset` update otherwise.
    pub async fn save(&mut self, ctx: &Context) -> OdmResult<SaveOutcome> {
        self.save_with(ctx, SaveOptions::default()).await
    }

    /// Saves with explicit options.
    ///
    /// # Errors
    ///
    /// - [`OdmError::Validation`] if validation fails; nothing is written.
    /// - [`OdmError::InvalidQuery`] if the condition does not compile.
    /// - [`OdmError::NotUnique`] if the store rejects a duplicate key.
    /// - [`OdmError::NotSaved`] if no stored document matched the identity and
    ///   condition filter.
    pub async fn save_with(&mut self, ctx: &Context, options: SaveOptions) -> OdmResult<SaveOutcome> {
        let schema = self.schema().clone();
        let collection = schema.collection_name()?;

        let condition = match &options.condition {
            Some(condition) => FilterCompiler::new(self.registry(), &schema).compile(condition.node())?,
            None => Document::new(),
        };

        if options.validate {
            self.validate()?;
        }

        if self.is_new() {
            let document = self.encode()?;
            let ack = ctx
                .executor()
                .execute_write(collection, WriteOp::InsertOne { document })
                .await?
                .into_result(collection)?;

            if self.pk().is_none() {
                if let (Some(pk), Some(id)) = (schema.primary_key(), ack.inserted_id) {
                    let value = pk.from_wire(&id, self.registry())?;
                    self.state_mut().current_mut_untracked().insert(pk.name().to_owned(), value);
                }
            }

            self.state_mut().commit();
            debug!(collection, id = ?self.id(), "Inserted document");
            return Ok(SaveOutcome::Inserted);
        }

        let delta = self.delta()?;
        if delta.is_empty() {
            debug!(collection, id = ?self.id(), "No changes to save");
            return Ok(SaveOutcome::Unchanged);
        }

        let id = self.stored_id()?;
        let filter = and_filters(pk_filter(&schema, id.clone())?, condition);
        let ack = ctx
            .executor()
            .execute_write(
                collection,
                WriteOp::UpdateOne {
                    filter,
                    update: delta.to_update_document(),
                    upsert: false,
                },
            )
            .await?
            .into_result(collection)?;

        if ack.matched_count == 0 {
            return Err(OdmError::NotSaved {
                collection: collection.to_owned(),
                id: id.to_string(),
                reason: "no stored document matched the identity and save condition".to_owned(),
            });
        }

        self.state_mut().commit();
        debug!(
            collection,
            id = %id,
            set = delta.set().len(),
            unset = delta.unset().len(),
            "Updated document"
        );

        Ok(SaveOutcome::Updated)
    }

    /// Deletes the stored document. Deleting a document that was never saved
    /// does nothing.
    pub async fn delete(&self, ctx: &Context) -> OdmResult<()> {
        if self.is_new() {
            return Ok(());
        }

        let schema = self.schema();
        let collection = schema.collection_name()?;
        let filter = pk_filter(schema, self.stored_id()?)?;

        ctx.executor()
            .execute_write(collection, WriteOp::DeleteOne { filter })
            .await?
            .into_result(collection)?;

        debug!(collection, id = ?self.id(), "Deleted document");
        Ok(())
    }

    /// Re-fetches the stored document, discarding unsaved changes.
    ///
    /// # Errors
    ///
    /// Returns [`OdmError::DoesNotExist`] if the document is gone.
    pub async fn reload(&mut self, ctx: &Context) -> OdmResult<()> {
        let id = self.stored_id()?;
        let fresh = ctx
            .objects(self.schema().name())?
            .filter(Q::new("pk", Value::Dynamic(id)))
            .first()
            .await?
            .ok_or_else(|| OdmError::DoesNotExist {
                schema: self.schema().name().to_owned(),
            })?;

        self.replace_with(fresh);
        Ok(())
    }

    fn stored_id(&self) -> OdmResult<Bson> {
        self.id().ok_or_else(|| OdmError::DoesNotExist {
            schema: self.schema().name().to_owned(),
        })
    }
}
