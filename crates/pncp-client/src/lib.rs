//! PNCP search-API client: typed wire model + retrying page fetch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use pncp_core::DateRange;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pncp-client";

/// Search endpoints the walk can page through. The progress key keeps them
/// apart so publication and delta walks over the same range never share a
/// checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TenderEndpoint {
    Publication,
    Update,
}

impl TenderEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            TenderEndpoint::Publication => "/v1/contratacoes/publicacao",
            TenderEndpoint::Update => "/v1/contratacoes/atualizacao",
        }
    }

    pub fn progress_key(self) -> &'static str {
        match self {
            TenderEndpoint::Publication => "publicacao",
            TenderEndpoint::Update => "atualizacao",
        }
    }
}

/// Organizational unit as the portal delivers it, nested inside a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUnit {
    pub codigo_unidade: Option<String>,
    pub nome_unidade: Option<String>,
    pub municipio_nome: Option<String>,
    pub uf_nome: Option<String>,
    pub uf_sigla: Option<String>,
    pub codigo_ibge: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEntity {
    pub cnpj: Option<String>,
    pub razao_social: Option<String>,
    pub poder_id: Option<String>,
    pub esfera_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLegalBasis {
    pub codigo: Option<i32>,
    pub nome: Option<String>,
    pub descricao: Option<String>,
}

/// One tender record exactly as the search API returns it. Every field is
/// optional on the wire; validation happens when the record is mapped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTender {
    #[serde(rename = "numeroControlePNCP")]
    pub numero_controle_pncp: Option<String>,
    pub numero_compra: Option<String>,
    pub ano_compra: Option<i32>,
    pub sequencial_compra: Option<i32>,
    pub processo: Option<String>,
    pub modalidade_id: Option<i32>,
    pub modalidade_nome: Option<String>,
    pub tipo_instrumento_convocatorio_nome: Option<String>,
    pub situacao_compra_id: Option<i32>,
    pub situacao_compra_nome: Option<String>,
    pub objeto_compra: Option<String>,
    pub valor_total_estimado: Option<f64>,
    pub valor_total_homologado: Option<f64>,
    pub data_inclusao: Option<NaiveDateTime>,
    pub data_publicacao_pncp: Option<NaiveDateTime>,
    pub data_atualizacao_global: Option<NaiveDateTime>,
    pub data_abertura_proposta: Option<NaiveDateTime>,
    pub data_encerramento_proposta: Option<NaiveDateTime>,
    pub modo_disputa_id: Option<i32>,
    pub modo_disputa_nome: Option<String>,
    pub srp: Option<bool>,
    pub usuario_nome: Option<String>,
    pub link_sistema_origem: Option<String>,
    pub link_processo_eletronico: Option<String>,
    pub unidade_orgao: Option<RawUnit>,
    pub orgao_entidade: Option<RawEntity>,
    pub amparo_legal: Option<RawLegalBasis>,
}

/// One page of search results. `data` is normalized to an array even when
/// the source collapses a single record into a bare object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderPage {
    #[serde(rename = "data", default, deserialize_with = "one_or_many")]
    pub records: Vec<RawTender>,
    #[serde(default)]
    pub total_paginas: u32,
    #[serde(default)]
    pub empty: bool,
}

impl TenderPage {
    pub fn total_pages(&self) -> u32 {
        self.total_paginas
    }

    pub fn empty_page() -> Self {
        Self {
            records: Vec::new(),
            total_paginas: 0,
            empty: true,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<RawTender>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<RawTender>),
        One(Box<RawTender>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(records)) => records,
        Some(OneOrMany::One(record)) => vec![*record],
    })
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Paginated tender source; the production impl is [`PncpClient`], tests
/// substitute scripted pages.
#[async_trait]
pub trait TenderSource: Send + Sync {
    async fn fetch_page(
        &self,
        endpoint: TenderEndpoint,
        range: DateRange,
        modality: u8,
        page: u32,
        page_size: u32,
    ) -> Result<TenderPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pncp.gov.br/api/consulta".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct PncpClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl PncpClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    async fn get_page(&self, url: &str, query: &[(&str, String)]) -> Result<TenderPage, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status == StatusCode::NO_CONTENT {
                        return Ok(TenderPage::empty_page());
                    }

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl TenderSource for PncpClient {
    async fn fetch_page(
        &self,
        endpoint: TenderEndpoint,
        range: DateRange,
        modality: u8,
        page: u32,
        page_size: u32,
    ) -> Result<TenderPage, FetchError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let query = [
            ("dataInicial", range.start_compact()),
            ("dataFinal", range.end_compact()),
            ("codigoModalidadeContratacao", modality.to_string()),
            ("pagina", page.to_string()),
            ("tamanhoPagina", page_size.to_string()),
        ];

        debug!(endpoint = endpoint.progress_key(), modality, page, "fetching page");
        self.get_page(&url, &query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_with_record_array_decodes() {
        let page: TenderPage = serde_json::from_str(
            r#"{
                "data": [
                    {"numeroControlePNCP": "00038000000199-1-000001/2025", "objetoCompra": "Aquisição de material"},
                    {"numeroControlePNCP": "00038000000199-1-000002/2025"}
                ],
                "totalPaginas": 7,
                "empty": false
            }"#,
        )
        .unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.total_pages(), 7);
        assert!(!page.empty);
        assert_eq!(
            page.records[0].numero_controle_pncp.as_deref(),
            Some("00038000000199-1-000001/2025")
        );
    }

    #[test]
    fn single_object_data_normalizes_to_one_element() {
        let page: TenderPage = serde_json::from_str(
            r#"{"data": {"numeroControlePNCP": "x-1-1/2025"}, "totalPaginas": 1, "empty": false}"#,
        )
        .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].numero_controle_pncp.as_deref(), Some("x-1-1/2025"));
    }

    #[test]
    fn null_or_missing_data_yields_empty_records() {
        let page: TenderPage =
            serde_json::from_str(r#"{"data": null, "totalPaginas": 0, "empty": true}"#).unwrap();
        assert!(page.records.is_empty());
        assert!(page.empty);

        let page: TenderPage = serde_json::from_str(r#"{"empty": true}"#).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total_pages(), 0);
    }

    #[test]
    fn wire_timestamps_and_nested_objects_decode() {
        let record: RawTender = serde_json::from_str(
            r#"{
                "numeroControlePNCP": "c-1-1/2025",
                "valorTotalEstimado": 150000.50,
                "dataAtualizacaoGlobal": "2025-01-02T10:30:00",
                "dataAberturaProposta": null,
                "srp": true,
                "unidadeOrgao": {"codigoUnidade": "1234", "nomeUnidade": "SECRETARIA DE SAUDE", "ufSigla": "RJ"},
                "orgaoEntidade": {"cnpj": "00038000000199", "razaoSocial": "MUNICIPIO EXEMPLO", "poderId": "E"},
                "amparoLegal": {"codigo": 1, "nome": "Lei 14.133/2021, Art. 28, I"}
            }"#,
        )
        .unwrap();

        assert_eq!(record.valor_total_estimado, Some(150_000.50));
        assert!(record.data_atualizacao_global.is_some());
        assert!(record.data_abertura_proposta.is_none());
        assert_eq!(record.srp, Some(true));
        assert_eq!(
            record.unidade_orgao.as_ref().and_then(|u| u.codigo_unidade.as_deref()),
            Some("1234")
        );
        assert_eq!(
            record.orgao_entidade.as_ref().and_then(|e| e.cnpj.as_deref()),
            Some("00038000000199")
        );
        assert_eq!(record.amparo_legal.as_ref().and_then(|b| b.codigo), Some(1));
    }

    #[test]
    fn endpoint_paths_and_progress_keys_differ() {
        assert_eq!(TenderEndpoint::Publication.path(), "/v1/contratacoes/publicacao");
        assert_eq!(TenderEndpoint::Update.path(), "/v1/contratacoes/atualizacao");
        assert_ne!(
            TenderEndpoint::Publication.progress_key(),
            TenderEndpoint::Update.progress_key()
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
