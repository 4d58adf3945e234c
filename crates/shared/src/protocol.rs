use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    domain::{LoginCredentials, NewUser, UserChanges, UserRecord},
    error::{ErrorList, IntentDecodeError},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUserDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<NewUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUserDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserChanges>,
}

/// A UI-originated request for a session operation.
///
/// `getUser` and `logoutUser` carry no input, so their `detail` may be
/// missing or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "camelCase")]
pub enum SessionIntent {
    LoginUser(LoginCredentials),
    RegisterUser(RegisterUserDetail),
    UpdateUser(UpdateUserDetail),
    GetUser {},
    LogoutUser {},
}

const INTENT_TYPES: &[&str] = &[
    "loginUser",
    "registerUser",
    "updateUser",
    "getUser",
    "logoutUser",
];

#[derive(Deserialize)]
struct RawIntent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    detail: Value,
}

impl RawIntent {
    fn into_intent(self) -> Result<SessionIntent, serde_json::Error> {
        // Register and update treat a missing detail like one without a user.
        let detail_or_empty = match self.detail {
            Value::Null => Value::Object(Default::default()),
            detail => detail,
        };
        let intent = match self.kind.as_str() {
            "loginUser" => SessionIntent::LoginUser(serde_json::from_value(detail_or_empty)?),
            "registerUser" => SessionIntent::RegisterUser(serde_json::from_value(detail_or_empty)?),
            "updateUser" => SessionIntent::UpdateUser(serde_json::from_value(detail_or_empty)?),
            "getUser" => SessionIntent::GetUser {},
            "logoutUser" => SessionIntent::LogoutUser {},
            other => return Err(de::Error::unknown_variant(other, INTENT_TYPES)),
        };
        Ok(intent)
    }
}

impl<'de> Deserialize<'de> for SessionIntent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawIntent::deserialize(deserializer)?
            .into_intent()
            .map_err(de::Error::custom)
    }
}

impl SessionIntent {
    pub fn from_json(raw: &str) -> Result<Self, IntentDecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionIntent::LoginUser(_) => "loginUser",
            SessionIntent::RegisterUser(_) => "registerUser",
            SessionIntent::UpdateUser(_) => "updateUser",
            SessionIntent::GetUser {} => "getUser",
            SessionIntent::LogoutUser {} => "logoutUser",
        }
    }
}

/// Request body wrapper: the backend expects every user payload under `user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest<T> {
    pub user: T,
}

/// Response body of every user endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorList>,
}

impl UserEnvelope {
    pub fn user(user: UserRecord) -> Self {
        Self {
            user: Some(user),
            errors: None,
        }
    }

    pub fn errors(errors: ErrorList) -> Self {
        Self {
            user: None,
            errors: Some(errors),
        }
    }
}
