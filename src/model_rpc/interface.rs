//! Model interface
//!
//! The fixed action set callers use, implemented by [`ModelRpcClient`] and
//! wrapped by [`CompanyScoped`] for multi-tenant callers.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use quarry_core::{FederationError, FederationResult};

use crate::model_rpc::client::ModelRpcClient;
use crate::model_rpc::envelope::{ActionName, Kwargs};

pub const COMPANY_ID: &str = "company_id";

#[async_trait]
pub trait ModelInterface: Send + Sync {
    async fn create(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()>;

    async fn learn(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()>;

    async fn predict(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue>;

    async fn analyse_dataset(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue>;

    async fn get_model_data(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue>;

    async fn get_models(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue>;

    async fn delete_model(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()>;

    /// Model updates are not offered by the backend.
    async fn update_model(&self, _args: Vec<JsonValue>, _kwargs: Kwargs) -> FederationResult<String> {
        Ok("Model updating is not available in this version".to_string())
    }
}

fn expect_value(action: ActionName, value: Option<JsonValue>) -> FederationResult<JsonValue> {
    value.ok_or_else(|| {
        FederationError::protocol(format!("{action} was acknowledged without a value"))
    })
}

#[async_trait]
impl ModelInterface for ModelRpcClient {
    async fn create(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
        self.invoke(ActionName::Create, args, kwargs).await.map(|_| ())
    }

    async fn learn(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
        self.invoke(ActionName::Learn, args, kwargs).await.map(|_| ())
    }

    async fn predict(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        let value = self.invoke(ActionName::Predict, args, kwargs).await?;
        expect_value(ActionName::Predict, value)
    }

    async fn analyse_dataset(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        let value = self.invoke(ActionName::AnalyseDataset, args, kwargs).await?;
        expect_value(ActionName::AnalyseDataset, value)
    }

    async fn get_model_data(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        let value = self.invoke(ActionName::GetModelData, args, kwargs).await?;
        expect_value(ActionName::GetModelData, value)
    }

    async fn get_models(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        let value = self.invoke(ActionName::GetModels, args, kwargs).await?;
        expect_value(ActionName::GetModels, value)
    }

    async fn delete_model(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
        self.invoke(ActionName::DeleteModel, args, kwargs).await.map(|_| ())
    }
}

/// Fills `company_id` into every call that did not set it.
pub struct CompanyScoped<M> {
    inner: M,
    company_id: Option<i64>,
}

impl<M: ModelInterface> CompanyScoped<M> {
    pub fn new(inner: M, company_id: Option<i64>) -> Self {
        Self { inner, company_id }
    }

    pub fn company_id(&self) -> Option<i64> {
        self.company_id
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    fn scoped(&self, mut kwargs: Kwargs) -> Kwargs {
        let unset = kwargs.get(COMPANY_ID).map_or(true, JsonValue::is_null);
        if unset {
            kwargs.insert(
                COMPANY_ID.to_string(),
                self.company_id.map_or(JsonValue::Null, JsonValue::from),
            );
        }
        kwargs
    }
}

#[async_trait]
impl<M: ModelInterface> ModelInterface for CompanyScoped<M> {
    async fn create(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
        self.inner.create(args, self.scoped(kwargs)).await
    }

    async fn learn(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
        self.inner.learn(args, self.scoped(kwargs)).await
    }

    async fn predict(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        self.inner.predict(args, self.scoped(kwargs)).await
    }

    async fn analyse_dataset(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        self.inner.analyse_dataset(args, self.scoped(kwargs)).await
    }

    async fn get_model_data(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        self.inner.get_model_data(args, self.scoped(kwargs)).await
    }

    async fn get_models(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
        self.inner.get_models(args, self.scoped(kwargs)).await
    }

    async fn delete_model(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
        self.inner.delete_model(args, self.scoped(kwargs)).await
    }

    async fn update_model(&self, args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<String> {
        self.inner.update_model(args, self.scoped(kwargs)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Kwargs>>,
    }

    #[async_trait]
    impl ModelInterface for Recorder {
        async fn create(&self, _args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
            self.seen.lock().unwrap().push(kwargs);
            Ok(())
        }

        async fn learn(&self, _args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<()> {
            self.seen.lock().unwrap().push(kwargs);
            Ok(())
        }

        async fn predict(&self, _args: Vec<JsonValue>, kwargs: Kwargs) -> FederationResult<JsonValue> {
            Ok(kwargs.get(COMPANY_ID).cloned().unwrap_or(JsonValue::Null))
        }

        async fn analyse_dataset(&self, _args: Vec<JsonValue>, _kwargs: Kwargs) -> FederationResult<JsonValue> {
            Ok(JsonValue::Null)
        }

        async fn get_model_data(&self, _args: Vec<JsonValue>, _kwargs: Kwargs) -> FederationResult<JsonValue> {
            Ok(JsonValue::Null)
        }

        async fn get_models(&self, _args: Vec<JsonValue>, _kwargs: Kwargs) -> FederationResult<JsonValue> {
            Ok(json!([]))
        }

        async fn delete_model(&self, _args: Vec<JsonValue>, _kwargs: Kwargs) -> FederationResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fills_company_id_when_missing() {
        let scoped = CompanyScoped::new(Recorder::default(), Some(42));
        assert_eq!(scoped.predict(vec![], Kwargs::new()).await.unwrap(), json!(42));

        let mut explicit = Kwargs::new();
        explicit.insert(COMPANY_ID.into(), json!(7));
        assert_eq!(scoped.predict(vec![], explicit).await.unwrap(), json!(7));

        let mut null = Kwargs::new();
        null.insert(COMPANY_ID.into(), JsonValue::Null);
        assert_eq!(scoped.predict(vec![], null).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn keeps_other_kwargs() {
        let scoped = CompanyScoped::new(Recorder::default(), None);
        let mut kwargs = Kwargs::new();
        kwargs.insert("to_predict".into(), json!("price"));
        scoped.learn(vec![json!("m")], kwargs).await.unwrap();

        let seen = scoped.inner().seen.lock().unwrap();
        assert_eq!(seen[0].get("to_predict"), Some(&json!("price")));
        assert_eq!(seen[0].get(COMPANY_ID), Some(&JsonValue::Null));
    }

    #[tokio::test]
    async fn update_is_not_offered() {
        let scoped = CompanyScoped::new(Recorder::default(), Some(1));
        let message = scoped.update_model(vec![], Kwargs::new()).await.unwrap();
        assert!(message.contains("not available"));
    }
}
