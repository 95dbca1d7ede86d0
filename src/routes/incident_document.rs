use actix_web::{delete, get, patch, post, put, web, HttpResponse};
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;

use crate::models::incident_document::{
    IncidentDocument, IncidentDocumentPatch, IncidentDocumentQuery, IncidentDocumentRequest,
    IncidentDocumentResponse,
};

#[derive(Debug, Deserialize)]
pub struct IncidentDocumentQueryParams {
    pub incident: Option<String>,
    pub search: Option<String>,
}

#[get("/incident-documents")]
pub async fn get_incident_documents(
    params: web::Query<IncidentDocumentQueryParams>,
) -> HttpResponse {
    let params: IncidentDocumentQueryParams = params.into_inner();

    let incident_id: Option<ObjectId> = match &params.incident {
        Some(incident) => match incident.parse() {
            Ok(incident_id) => Some(incident_id),
            Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
        },
        None => None,
    };
    let query: IncidentDocumentQuery = IncidentDocumentQuery {
        incident_id,
        search: params.search,
    };

    match IncidentDocument::find_many(&query).await {
        Ok(documents) => {
            let results: Vec<IncidentDocumentResponse> =
                documents.iter().map(IncidentDocument::response).collect();
            HttpResponse::Ok().json(results)
        }
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[get("/incident-documents/{document_id}")]
pub async fn get_incident_document(document_id: web::Path<String>) -> HttpResponse {
    let document_id: ObjectId = match document_id.parse() {
        Ok(document_id) => document_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    match IncidentDocument::find_by_id(&document_id).await {
        Ok(Some(document)) => HttpResponse::Ok().json(document.response()),
        Ok(None) => HttpResponse::NotFound().body("DOCUMENT_NOT_FOUND"),
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[post("/incident-documents")]
pub async fn create_incident_document(
    payload: web::Json<IncidentDocumentRequest>,
) -> HttpResponse {
    let payload: IncidentDocumentRequest = payload.into_inner();

    let incident_id: ObjectId = match payload.incident.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    let mut document: IncidentDocument = IncidentDocument {
        _id: None,
        incident_id,
        title: payload.title,
        url: payload.url,
        created_at: mongodb::bson::DateTime::now(),
    };

    match document.save().await {
        Ok(_) => HttpResponse::Created().json(document.response()),
        Err(error) => {
            if error == "INCIDENT_NOT_FOUND" {
                HttpResponse::NotFound().body(error)
            } else {
                HttpResponse::InternalServerError().body(error)
            }
        }
    }
}

async fn apply_document_patch(
    document_id: web::Path<String>,
    payload: web::Json<IncidentDocumentPatch>,
) -> HttpResponse {
    let document_id: ObjectId = match document_id.parse() {
        Ok(document_id) => document_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    if let Ok(Some(_)) = IncidentDocument::find_by_id(&document_id).await {
        let patch: IncidentDocumentPatch = payload.into_inner();

        if let Err(error) = IncidentDocument::update_by_id(&document_id, &patch).await {
            return HttpResponse::InternalServerError().body(error);
        }
        match IncidentDocument::find_by_id(&document_id).await {
            Ok(Some(document)) => HttpResponse::Ok().json(document.response()),
            _ => HttpResponse::InternalServerError().body("DOCUMENT_NOT_FOUND"),
        }
    } else {
        HttpResponse::NotFound().body("DOCUMENT_NOT_FOUND")
    }
}

#[put("/incident-documents/{document_id}")]
pub async fn update_incident_document(
    document_id: web::Path<String>,
    payload: web::Json<IncidentDocumentPatch>,
) -> HttpResponse {
    apply_document_patch(document_id, payload).await
}

#[patch("/incident-documents/{document_id}")]
pub async fn patch_incident_document(
    document_id: web::Path<String>,
    payload: web::Json<IncidentDocumentPatch>,
) -> HttpResponse {
    apply_document_patch(document_id, payload).await
}

#[delete("/incident-documents/{document_id}")]
pub async fn delete_incident_document(document_id: web::Path<String>) -> HttpResponse {
    let document_id: ObjectId = match document_id.parse() {
        Ok(document_id) => document_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    if let Ok(Some(_)) = IncidentDocument::find_by_id(&document_id).await {
        match IncidentDocument::delete_by_id(&document_id).await {
            Ok(_) => HttpResponse::NoContent().finish(),
            Err(error) => HttpResponse::InternalServerError().body(error),
        }
    } else {
        HttpResponse::NotFound().body("DOCUMENT_NOT_FOUND")
    }
}
