use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::models::{RawComment, SurveyResponse, UserProfile};

/// Comment as served by `GET /comments`.
///
/// Older deployments emit `sentiment`, newer ones `sentimiento`; both are
/// accepted here and collapsed by [`ApiComment::into_raw`]. Every field is
/// read leniently: a value of the wrong JSON type becomes `None`, so one odd
/// row turns into a malformed record instead of failing the whole list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiComment {
    #[serde(default, deserialize_with = "lenient_string")]
    pub usuario: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub pregunta: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub respuesta: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sentimiento: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sentiment: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub polaridad: Option<f64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
}

impl ApiComment {
    /// Decode one element of the comments array. Anything that is not an
    /// object comes back empty and is later reported as malformed.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn into_raw(self) -> RawComment {
        let label = pick_non_blank(self.sentimiento, self.sentiment);
        RawComment {
            user: self.usuario.unwrap_or_default(),
            prompt: self.pregunta.unwrap_or_default(),
            answer: self.respuesta.unwrap_or_default(),
            sentiment_label: label,
            timestamp: self.timestamp.filter(|t| !t.trim().is_empty()),
        }
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Value::deserialize(d)?.as_f64())
}

fn pick_non_blank(primary: Option<String>, fallback: Option<String>) -> Option<String> {
    primary
        .filter(|s| !s.trim().is_empty())
        .or_else(|| fallback.filter(|s| !s.trim().is_empty()))
}

/// User as served by `GET /users`. `age` is loosely typed upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Value,
}

impl ApiUser {
    pub fn into_profile(self) -> UserProfile {
        UserProfile {
            email: self.email,
            name: self.name,
            // only real JSON numbers count as an age
            age: self.age.as_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCheckUser {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiAnswer {
    pub pregunta: String,
    pub respuesta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSubmission {
    pub email: String,
    pub respuestas: Vec<ApiAnswer>,
}

impl ApiSubmission {
    pub fn new(email: &str, responses: &[SurveyResponse]) -> Self {
        Self {
            email: email.to_string(),
            respuestas: responses
                .iter()
                .map(|r| ApiAnswer {
                    pregunta: r.prompt.clone(),
                    respuesta: r.answer.clone(),
                })
                .collect(),
        }
    }
}

/// Error body returned by the backend on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn adapter_prefers_sentimiento_and_falls_back_to_sentiment() {
        let spanish: ApiComment = serde_json::from_value(json!({
            "usuario": "ana@gmail.com",
            "pregunta": "q",
            "respuesta": "a",
            "sentimiento": "positivo",
            "sentiment": "negativo",
            "timestamp": "2024-03-01T10:00:00"
        }))
        .unwrap();
        assert_eq!(spanish.into_raw().sentiment_label.as_deref(), Some("positivo"));

        let legacy: ApiComment = serde_json::from_value(json!({
            "usuario": "ana@gmail.com",
            "sentimiento": "  ",
            "sentiment": "Neutro",
            "timestamp": "2024-03-01"
        }))
        .unwrap();
        let raw = legacy.into_raw();
        assert_eq!(raw.sentiment_label.as_deref(), Some("Neutro"));
        assert_eq!(raw.prompt, "");
    }

    #[test]
    fn wrongly_typed_fields_do_not_fail_the_list() {
        let list: Vec<ApiComment> = serde_json::from_value(json!([
            {
                "usuario": "ana@gmail.com",
                "sentimiento": "positivo",
                "polaridad": 0.5,
                "timestamp": "2024-03-01"
            },
            {
                "usuario": "luis@gmail.com",
                "sentimiento": 3,
                "polaridad": "high",
                "timestamp": 1709290000
            }
        ]))
        .unwrap();
        assert_eq!(list.len(), 2);

        let odd = list[1].clone().into_raw();
        assert_eq!(odd.user, "luis@gmail.com");
        assert_eq!(odd.sentiment_label, None);
        assert_eq!(odd.timestamp, None);
        assert_eq!(list[1].polaridad, None);
        assert_eq!(list[0].polaridad, Some(0.5));
    }

    #[test]
    fn non_object_elements_decode_empty() {
        let raw = ApiComment::from_value(json!("garbage")).into_raw();
        assert_eq!(raw.user, "");
        assert_eq!(raw.sentiment_label, None);
    }

    #[test]
    fn adapter_drops_blank_timestamp() {
        let c: ApiComment = serde_json::from_value(json!({
            "usuario": "x@gmail.com",
            "sentimiento": "neutro",
            "timestamp": ""
        }))
        .unwrap();
        assert_eq!(c.into_raw().timestamp, None);
    }

    #[test]
    fn user_age_must_be_a_json_number() {
        let numeric: ApiUser =
            serde_json::from_value(json!({"email": "a@gmail.com", "age": 30})).unwrap();
        let textual: ApiUser =
            serde_json::from_value(json!({"email": "b@gmail.com", "age": "30"})).unwrap();
        let missing: ApiUser = serde_json::from_value(json!({"email": "c@gmail.com"})).unwrap();

        assert_eq!(numeric.into_profile().age, Some(30.0));
        assert_eq!(textual.into_profile().age, None);
        assert_eq!(missing.into_profile().age, None);
    }

    #[test]
    fn submission_keeps_answer_order() {
        let responses = vec![
            SurveyResponse { prompt: "p1".into(), answer: "a1".into() },
            SurveyResponse { prompt: "p2".into(), answer: "a2".into() },
        ];
        let body = serde_json::to_value(ApiSubmission::new("u@gmail.com", &responses)).unwrap();
        assert_eq!(
            body,
            json!({
                "email": "u@gmail.com",
                "respuestas": [
                    {"pregunta": "p1", "respuesta": "a1"},
                    {"pregunta": "p2", "respuesta": "a2"}
                ]
            })
        );
    }
}
