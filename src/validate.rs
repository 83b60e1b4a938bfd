use serde::{de, Deserialize, Deserializer};
use utoipa::ToSchema;
use validator::Validate;

use crate::error::ApiError;

/// Request body that is validated while it is deserialized, so handlers only
/// ever see well-formed input. Failures surface as a JSON rejection.
#[derive(Debug, ToSchema)]
pub struct ValidatedForm<T>(pub T);

impl<'de, T> Deserialize<'de> for ValidatedForm<T>
where
    T: Deserialize<'de> + Validate,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = T::deserialize(deserializer)?;
        value.validate().map_err(de::Error::custom)?;
        Ok(ValidatedForm(value))
    }
}

/// Validates query parameters after extraction.
pub fn validated<T: Validate>(value: T) -> Result<T, ApiError> {
    value
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Validate, Debug)]
    struct Form {
        #[validate(length(min = 3))]
        name: String,
    }

    #[test]
    fn accepts_valid_body() {
        let ValidatedForm(form) =
            serde_json::from_str::<ValidatedForm<Form>>(r#"{"name": "Aminata"}"#).unwrap();
        assert_eq!(form.name, "Aminata");
    }

    #[test]
    fn rejects_invalid_body_during_deserialization() {
        let err = serde_json::from_str::<ValidatedForm<Form>>(r#"{"name": "A"}"#).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn query_validation_is_bad_request() {
        let err = validated(Form { name: "x".into() }).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
