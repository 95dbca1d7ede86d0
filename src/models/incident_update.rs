use crate::database::get_db;
use chrono::Utc;
use futures::stream::StreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, DateTime},
    options::FindOptions,
    Collection, Database,
};
use serde::{Deserialize, Serialize};

use super::incident::{validate_email, Incident, ValidationErrors};

/// The four kinds are a fixed part of the API contract, unlike the
/// config-driven incident enums.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IncidentUpdateKind {
    #[default]
    Update,
    Mitigation,
    Resolution,
    Note,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IncidentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,
    pub incident_id: ObjectId,
    pub content: String,
    pub author: String,
    pub update_type: IncidentUpdateKind,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IncidentUpdateRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub update_type: IncidentUpdateKind,
}

#[derive(Debug, Serialize)]
pub struct IncidentUpdateResponse {
    pub _id: String,
    pub content: String,
    pub author: String,
    pub update_type: IncidentUpdateKind,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl IncidentUpdateRequest {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors: ValidationErrors = ValidationErrors::default();

        if self.content.is_empty() {
            errors.add("content", "This field may not be blank.");
        }
        if self.author.is_empty() {
            errors.add("author", "This field may not be blank.");
        }
        validate_email(&mut errors, "author", &self.author);

        errors.into_result()
    }

    pub fn into_update(self, incident_id: ObjectId, created_by: Option<String>) -> IncidentUpdate {
        let now: DateTime = DateTime::now();

        IncidentUpdate {
            _id: None,
            incident_id,
            content: self.content,
            author: self.author,
            update_type: self.update_type,
            created_at: now,
            updated_at: now,
            created_by,
        }
    }
}

impl IncidentUpdate {
    pub async fn save(&mut self) -> Result<ObjectId, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentUpdate> =
            db.collection::<IncidentUpdate>("incident-updates");

        if let Ok(Some(_)) = Incident::find_by_id(&self.incident_id).await {
            self._id = Some(ObjectId::new());

            collection
                .insert_one(self, None)
                .await
                .map_err(|_| "INSERTING_FAILED".to_string())
                .map(|result| result.inserted_id.as_object_id().unwrap())
        } else {
            Err("INCIDENT_NOT_FOUND".to_string())
        }
    }

    // Newest first: the update log reads like a feed.
    pub async fn find_by_incident(incident_id: &ObjectId) -> Result<Vec<IncidentUpdate>, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentUpdate> =
            db.collection::<IncidentUpdate>("incident-updates");

        let options: FindOptions = FindOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();

        let mut updates: Vec<IncidentUpdate> = Vec::new();
        if let Ok(mut cursor) = collection
            .find(doc! { "incident_id": incident_id }, options)
            .await
        {
            while let Some(Ok(update)) = cursor.next().await {
                updates.push(update);
            }
            Ok(updates)
        } else {
            Err("UPDATE_NOT_FOUND".to_string())
        }
    }

    pub async fn delete_by_incident(incident_id: &ObjectId) -> Result<u64, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentUpdate> =
            db.collection::<IncidentUpdate>("incident-updates");

        collection
            .delete_many(doc! { "incident_id": incident_id }, None)
            .await
            .map_err(|_| "UPDATE_DELETION_FAILED".to_string())
            .map(|result| result.deleted_count)
    }

    pub fn response(&self) -> IncidentUpdateResponse {
        IncidentUpdateResponse {
            _id: self._id.map(|_id| _id.to_string()).unwrap_or_default(),
            content: self.content.clone(),
            author: self.author.clone(),
            update_type: self.update_type,
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_kind_uses_snake_case_wire_names() {
        let kind: IncidentUpdateKind = serde_json::from_str(r#""mitigation""#).unwrap();
        assert_eq!(kind, IncidentUpdateKind::Mitigation);
        assert_eq!(
            serde_json::to_string(&IncidentUpdateKind::Resolution).unwrap(),
            r#""resolution""#
        );
    }

    #[test]
    fn update_kind_defaults_to_update() {
        let request: IncidentUpdateRequest =
            serde_json::from_str(r#"{ "content": "c", "author": "a@example.com" }"#).unwrap();
        assert_eq!(request.update_type, IncidentUpdateKind::Update);
    }

    #[test]
    fn blank_content_and_author_are_rejected() {
        let request: IncidentUpdateRequest = serde_json::from_str(r#"{}"#).unwrap();
        let errors = request.validate().unwrap_err();
        let value = serde_json::to_value(&errors).unwrap();
        assert!(value.get("content").is_some());
        assert!(value.get("author").is_some());
    }

    #[test]
    fn author_must_be_an_email() {
        let request: IncidentUpdateRequest =
            serde_json::from_str(r#"{ "content": "c", "author": "nope" }"#).unwrap();
        let errors = request.validate().unwrap_err();
        let value = serde_json::to_value(&errors).unwrap();
        assert_eq!(value["author"][0], "Enter a valid email address.");
    }

    #[test]
    fn attribution_is_kept_alongside_the_author() {
        let request: IncidentUpdateRequest =
            serde_json::from_str(r#"{ "content": "c", "author": "a@example.com" }"#).unwrap();
        let update = request.into_update(ObjectId::new(), Some("actor@example.com".to_string()));
        assert_eq!(update.author, "a@example.com");
        assert_eq!(update.created_by.as_deref(), Some("actor@example.com"));
        assert_eq!(update.created_at, update.updated_at);
    }
}
