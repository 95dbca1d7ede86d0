use actix_web::{delete, get, patch, post, put, web, HttpMessage, HttpRequest, HttpResponse};
use mongodb::bson::oid::ObjectId;
use serde::Deserialize;

use crate::config::ChoiceConfig;
use crate::identity::Actor;
use crate::models::{
    incident::{
        Incident, IncidentListResponse, IncidentPatch, IncidentQuery, IncidentRequest,
        IncidentResponse, IncidentSummaryResponse,
    },
    incident_document::{IncidentDocument, IncidentDocumentStub},
    incident_update::{IncidentUpdate, IncidentUpdateRequest, IncidentUpdateResponse},
};

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    #[serde(default)]
    pub status: String,
}

fn query_pairs(req: &HttpRequest) -> Result<Vec<(String, String)>, HttpResponse> {
    web::Query::<Vec<(String, String)>>::from_query(req.query_string())
        .map(|pairs| pairs.into_inner())
        .map_err(|_| HttpResponse::BadRequest().body("INVALID_QUERY"))
}

async fn incident_detail(incident: Incident) -> Result<IncidentResponse, String> {
    let _id: ObjectId = incident._id.unwrap();
    let documents = IncidentDocument::find_by_incident(&_id).await?;
    let updates = IncidentUpdate::find_by_incident(&_id).await?;

    Ok(incident.detail(
        documents.iter().map(IncidentDocument::response).collect(),
        updates.iter().map(IncidentUpdate::response).collect(),
    ))
}

#[get("/incidents")]
pub async fn get_incidents(req: HttpRequest) -> HttpResponse {
    let pairs = match query_pairs(&req) {
        Ok(pairs) => pairs,
        Err(response) => return response,
    };
    let query: IncidentQuery = IncidentQuery::from_pairs(&pairs);

    let count: u64 = match Incident::count(query.filter_document()).await {
        Ok(count) => count,
        Err(error) => return HttpResponse::InternalServerError().body(error),
    };

    match Incident::find_many(&query).await {
        Ok(incidents) => {
            let results: Vec<IncidentSummaryResponse> =
                incidents.iter().map(Incident::summary).collect();
            HttpResponse::Ok().json(IncidentListResponse {
                count,
                page: query.page_number(),
                page_size: query.resolved_page_size(),
                results,
            })
        }
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[get("/incidents/statistics")]
pub async fn get_incident_statistics(req: HttpRequest) -> HttpResponse {
    let pairs = match query_pairs(&req) {
        Ok(pairs) => pairs,
        Err(response) => return response,
    };
    let query: IncidentQuery = IncidentQuery::from_pairs(&pairs);

    match Incident::statistics(query.filter_document()).await {
        Ok(statistics) => HttpResponse::Ok().json(statistics),
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[get("/incidents/critical")]
pub async fn get_critical_incidents() -> HttpResponse {
    match Incident::find_critical().await {
        Ok(incidents) => {
            let results: Vec<IncidentSummaryResponse> =
                incidents.iter().map(Incident::summary).collect();
            HttpResponse::Ok().json(results)
        }
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[get("/incidents/{incident_id}")]
pub async fn get_incident(incident_id: web::Path<String>) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    match Incident::find_by_id(&incident_id).await {
        Ok(Some(incident)) => match incident_detail(incident).await {
            Ok(detail) => HttpResponse::Ok().json(detail),
            Err(error) => HttpResponse::InternalServerError().body(error),
        },
        Ok(None) => HttpResponse::NotFound().body("INCIDENT_NOT_FOUND"),
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[post("/incidents")]
pub async fn create_incident(
    payload: web::Json<IncidentRequest>,
    config: web::Data<ChoiceConfig>,
    req: HttpRequest,
) -> HttpResponse {
    let payload: IncidentRequest = payload.into_inner();

    if let Err(errors) = payload.validate(&config) {
        return HttpResponse::BadRequest().json(errors);
    }

    let created_by: Option<String> = req
        .extensions()
        .get::<Actor>()
        .map(|actor| actor.email.clone());

    let stubs: Vec<IncidentDocumentStub> = payload.related_documents.clone();
    let mut incident: Incident = payload.into_incident(created_by);

    let _id: ObjectId = match incident.save().await {
        Ok(_id) => _id,
        Err(error) => return HttpResponse::InternalServerError().body(error),
    };
    if let Err(error) = IncidentDocument::save_stubs(&_id, &stubs).await {
        return HttpResponse::InternalServerError().body(error);
    }

    match incident_detail(incident).await {
        Ok(detail) => HttpResponse::Created().json(detail),
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

async fn apply_incident_patch(
    incident_id: web::Path<String>,
    payload: web::Json<IncidentPatch>,
    config: web::Data<ChoiceConfig>,
) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    let patch: IncidentPatch = payload.into_inner();
    if let Err(errors) = patch.validate(&config) {
        return HttpResponse::BadRequest().json(errors);
    }

    if let Ok(Some(_)) = Incident::find_by_id(&incident_id).await {
        // A supplied document list replaces the whole set.
        if let Some(stubs) = &patch.related_documents {
            if let Err(error) = IncidentDocument::delete_by_incident(&incident_id).await {
                return HttpResponse::InternalServerError().body(error);
            }
            if let Err(error) = IncidentDocument::save_stubs(&incident_id, stubs).await {
                return HttpResponse::InternalServerError().body(error);
            }
        }

        if let Err(error) = Incident::update_by_id(&incident_id, &patch).await {
            return HttpResponse::InternalServerError().body(error);
        }
        match Incident::find_by_id(&incident_id).await {
            Ok(Some(incident)) => match incident_detail(incident).await {
                Ok(detail) => HttpResponse::Ok().json(detail),
                Err(error) => HttpResponse::InternalServerError().body(error),
            },
            _ => HttpResponse::InternalServerError().body("INCIDENT_NOT_FOUND"),
        }
    } else {
        HttpResponse::NotFound().body("INCIDENT_NOT_FOUND")
    }
}

#[put("/incidents/{incident_id}")]
pub async fn update_incident(
    incident_id: web::Path<String>,
    payload: web::Json<IncidentPatch>,
    config: web::Data<ChoiceConfig>,
) -> HttpResponse {
    apply_incident_patch(incident_id, payload, config).await
}

#[patch("/incidents/{incident_id}")]
pub async fn patch_incident(
    incident_id: web::Path<String>,
    payload: web::Json<IncidentPatch>,
    config: web::Data<ChoiceConfig>,
) -> HttpResponse {
    apply_incident_patch(incident_id, payload, config).await
}

#[delete("/incidents/{incident_id}")]
pub async fn delete_incident(incident_id: web::Path<String>) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    if let Ok(Some(_)) = Incident::find_by_id(&incident_id).await {
        match Incident::delete_by_id(&incident_id).await {
            Ok(_) => HttpResponse::NoContent().finish(),
            Err(error) => HttpResponse::InternalServerError().body(error),
        }
    } else {
        HttpResponse::NotFound().body("INCIDENT_NOT_FOUND")
    }
}

#[post("/incidents/{incident_id}/update_status")]
pub async fn update_incident_status(
    incident_id: web::Path<String>,
    payload: web::Json<StatusRequest>,
    config: web::Data<ChoiceConfig>,
) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };
    let payload: StatusRequest = payload.into_inner();

    if let Ok(Some(_)) = Incident::find_by_id(&incident_id).await {
        if !config.is_valid_value("statuses", &payload.status) {
            return HttpResponse::BadRequest().body("INVALID_STATUS");
        }

        if let Err(error) = Incident::update_status(&incident_id, &payload.status).await {
            return HttpResponse::InternalServerError().body(error);
        }
        match Incident::find_by_id(&incident_id).await {
            Ok(Some(incident)) => match incident_detail(incident).await {
                Ok(detail) => HttpResponse::Ok().json(detail),
                Err(error) => HttpResponse::InternalServerError().body(error),
            },
            _ => HttpResponse::InternalServerError().body("INCIDENT_NOT_FOUND"),
        }
    } else {
        HttpResponse::NotFound().body("INCIDENT_NOT_FOUND")
    }
}

#[get("/incidents/{incident_id}/timeline")]
pub async fn get_incident_timeline(incident_id: web::Path<String>) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    match Incident::find_by_id(&incident_id).await {
        Ok(Some(incident)) => HttpResponse::Ok().json(incident.timeline()),
        Ok(None) => HttpResponse::NotFound().body("INCIDENT_NOT_FOUND"),
        Err(error) => HttpResponse::InternalServerError().body(error),
    }
}

#[get("/incidents/{incident_id}/updates")]
pub async fn get_incident_updates(incident_id: web::Path<String>) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    if let Ok(Some(_)) = Incident::find_by_id(&incident_id).await {
        match IncidentUpdate::find_by_incident(&incident_id).await {
            Ok(updates) => {
                let results: Vec<IncidentUpdateResponse> =
                    updates.iter().map(IncidentUpdate::response).collect();
                HttpResponse::Ok().json(results)
            }
            Err(error) => HttpResponse::InternalServerError().body(error),
        }
    } else {
        HttpResponse::NotFound().body("INCIDENT_NOT_FOUND")
    }
}

#[post("/incidents/{incident_id}/updates")]
pub async fn create_incident_update(
    incident_id: web::Path<String>,
    payload: web::Json<IncidentUpdateRequest>,
    req: HttpRequest,
) -> HttpResponse {
    let incident_id: ObjectId = match incident_id.parse() {
        Ok(incident_id) => incident_id,
        Err(_) => return HttpResponse::BadRequest().body("INVALID_ID"),
    };

    let payload: IncidentUpdateRequest = payload.into_inner();
    if let Err(errors) = payload.validate() {
        return HttpResponse::BadRequest().json(errors);
    }

    let created_by: Option<String> = req
        .extensions()
        .get::<Actor>()
        .map(|actor| actor.email.clone());

    let mut update: IncidentUpdate = payload.into_update(incident_id, created_by);
    match update.save().await {
        Ok(_) => HttpResponse::Created().json(update.response()),
        Err(error) => {
            if error == "INCIDENT_NOT_FOUND" {
                HttpResponse::NotFound().body(error)
            } else {
                HttpResponse::InternalServerError().body(error)
            }
        }
    }
}
