use crate::database::get_db;
use chrono::Utc;
use futures::stream::StreamExt;
use mongodb::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    options::FindOptions,
    Collection, Database,
};
use serde::{Deserialize, Serialize};

use super::incident::Incident;

#[derive(Debug, Deserialize, Serialize)]
pub struct IncidentDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,
    pub incident_id: ObjectId,
    pub title: String,
    pub url: String,
    pub created_at: DateTime,
}

/// Write-payload shape carried inside incident create/update requests.
/// Stubs missing a title or url are dropped, not rejected.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IncidentDocumentStub {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IncidentDocumentRequest {
    pub incident: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IncidentDocumentPatch {
    pub title: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Default)]
pub struct IncidentDocumentQuery {
    pub incident_id: Option<ObjectId>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IncidentDocumentResponse {
    pub _id: String,
    pub title: String,
    pub url: String,
    pub created_at: chrono::DateTime<Utc>,
}

impl IncidentDocumentStub {
    pub fn is_complete(&self) -> bool {
        !self.title.is_empty() && !self.url.is_empty()
    }
}

fn complete_stubs(stubs: &[IncidentDocumentStub]) -> Vec<&IncidentDocumentStub> {
    stubs.iter().filter(|stub| stub.is_complete()).collect()
}

impl IncidentDocumentQuery {
    pub fn filter_document(&self) -> Document {
        let mut filter: Document = Document::new();

        if let Some(incident_id) = self.incident_id {
            filter.insert("incident_id", incident_id);
        }
        if let Some(search) = &self.search {
            if !search.is_empty() {
                let pattern: String = regex::escape(search);
                filter.insert(
                    "$or",
                    vec![
                        doc! { "title": { "$regex": &pattern, "$options": "i" } },
                        doc! { "url": { "$regex": &pattern, "$options": "i" } },
                    ],
                );
            }
        }
        filter
    }
}

impl IncidentDocument {
    pub async fn save(&mut self) -> Result<ObjectId, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentDocument> =
            db.collection::<IncidentDocument>("incident-documents");

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

    pub async fn save_stubs(
        incident_id: &ObjectId,
        stubs: &[IncidentDocumentStub],
    ) -> Result<(), String> {
        for stub in complete_stubs(stubs) {
            let mut document: IncidentDocument = IncidentDocument {
                _id: None,
                incident_id: *incident_id,
                title: stub.title.clone(),
                url: stub.url.clone(),
                created_at: DateTime::now(),
            };
            document.save().await?;
        }
        Ok(())
    }

    pub async fn find_many(query: &IncidentDocumentQuery) -> Result<Vec<IncidentDocument>, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentDocument> =
            db.collection::<IncidentDocument>("incident-documents");

        let options: FindOptions = FindOptions::builder()
            .sort(doc! { "created_at": 1 })
            .build();

        let mut documents: Vec<IncidentDocument> = Vec::new();
        if let Ok(mut cursor) = collection.find(query.filter_document(), options).await {
            while let Some(Ok(document)) = cursor.next().await {
                documents.push(document);
            }
            Ok(documents)
        } else {
            Err("DOCUMENT_NOT_FOUND".to_string())
        }
    }

    pub async fn find_by_incident(incident_id: &ObjectId) -> Result<Vec<IncidentDocument>, String> {
        let query: IncidentDocumentQuery = IncidentDocumentQuery {
            incident_id: Some(*incident_id),
            search: None,
        };
        Self::find_many(&query).await
    }

    pub async fn find_by_id(_id: &ObjectId) -> Result<Option<IncidentDocument>, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentDocument> =
            db.collection::<IncidentDocument>("incident-documents");

        collection
            .find_one(doc! { "_id": _id }, None)
            .await
            .map_err(|_| "DOCUMENT_NOT_FOUND".to_string())
    }

    pub async fn update_by_id(
        _id: &ObjectId,
        patch: &IncidentDocumentPatch,
    ) -> Result<ObjectId, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentDocument> =
            db.collection::<IncidentDocument>("incident-documents");

        let mut set: Document = Document::new();
        if let Some(title) = &patch.title {
            set.insert("title", title.clone());
        }
        if let Some(url) = &patch.url {
            set.insert("url", url.clone());
        }
        if set.is_empty() {
            return Ok(*_id);
        }

        collection
            .update_one(doc! { "_id": _id }, doc! { "$set": set }, None)
            .await
            .map_err(|_| "UPDATE_FAILED".to_string())
            .map(|_| *_id)
    }

    pub async fn delete_by_id(_id: &ObjectId) -> Result<u64, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentDocument> =
            db.collection::<IncidentDocument>("incident-documents");

        collection
            .delete_one(doc! { "_id": _id }, None)
            .await
            .map_err(|_| "DOCUMENT_NOT_FOUND".to_string())
            .map(|result| result.deleted_count)
    }

    pub async fn delete_by_incident(incident_id: &ObjectId) -> Result<u64, String> {
        let db: Database = get_db();
        let collection: Collection<IncidentDocument> =
            db.collection::<IncidentDocument>("incident-documents");

        collection
            .delete_many(doc! { "incident_id": incident_id }, None)
            .await
            .map_err(|_| "DOCUMENT_DELETION_FAILED".to_string())
            .map(|result| result.deleted_count)
    }

    pub fn response(&self) -> IncidentDocumentResponse {
        IncidentDocumentResponse {
            _id: self._id.map(|_id| _id.to_string()).unwrap_or_default(),
            title: self.title.clone(),
            url: self.url.clone(),
            created_at: self.created_at.to_chrono(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(title: &str, url: &str) -> IncidentDocumentStub {
        IncidentDocumentStub {
            title: title.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn incomplete_stubs_are_dropped() {
        let stubs = vec![
            stub("A", "http://x"),
            stub("", "http://y"),
            stub("B", ""),
            stub("", ""),
        ];

        let kept = complete_stubs(&stubs);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "A");
    }

    #[test]
    fn stub_payload_tolerates_missing_fields() {
        let stub: IncidentDocumentStub = serde_json::from_str(r#"{ "url": "http://y" }"#).unwrap();
        assert_eq!(stub.title, "");
        assert!(!stub.is_complete());
    }

    #[test]
    fn parent_filter_and_search_combine() {
        let incident_id = ObjectId::new();
        let query = IncidentDocumentQuery {
            incident_id: Some(incident_id),
            search: Some("runbook".to_string()),
        };

        let filter = query.filter_document();
        assert_eq!(filter.get_object_id("incident_id").unwrap(), incident_id);
        assert_eq!(filter.get_array("$or").unwrap().len(), 2);
    }
}
