//! Shopify Admin REST client.
//!
//! Products are paged with cursor pagination: the next cursor is the
//! `page_info` query parameter of the `rel="next"` entry in the `Link`
//! response header.

use std::io::Read;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_TYPE, LINK};
use serde::Deserialize;
use url::Url;

use crate::catalog::{CatalogClient, CatalogError, CatalogItem, CatalogPage, CatalogProvider};
use crate::config::CatalogConfig;
use crate::store::TenantRecord;

const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";

/// Shopify refuses larger pages.
const MAX_PAGE_LIMIT: u32 = 250;

static NEXT_LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).expect("Failed to compile Link header regex")
});

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    products: Vec<ShopifyProduct>,
}

#[derive(Debug, Deserialize)]
struct ShopifyProduct {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    handle: String,
    #[serde(default)]
    images: Vec<ShopifyImage>,
}

#[derive(Debug, Deserialize)]
struct ShopifyImage {
    #[serde(default)]
    src: Option<String>,
}

impl From<ShopifyProduct> for CatalogItem {
    fn from(product: ShopifyProduct) -> Self {
        let image_url = product
            .images
            .into_iter()
            .next()
            .and_then(|image| image.src)
            .filter(|src| !src.is_empty());

        CatalogItem {
            item_id: product.id.to_string(),
            title: product.title,
            handle: product.handle,
            image_url,
        }
    }
}

/// Turns a shop name or domain into the shop's API origin.
pub fn shop_base_url(shop_domain: &str) -> Result<Url, CatalogError> {
    let domain = shop_domain
        .trim()
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let host = if domain.contains('.') {
        domain.to_string()
    } else {
        format!("{domain}.myshopify.com")
    };

    Url::parse(&format!("https://{host}"))
        .map_err(|e| CatalogError::Auth(format!("invalid shop domain {shop_domain:?}: {e}")))
}

/// `page_info` of the `rel="next"` link, if any.
pub fn parse_next_cursor(link_header: &str) -> Option<String> {
    link_header
        .split(',')
        .filter_map(|part| NEXT_LINK_REGEX.captures(part))
        .filter_map(|caps| Url::parse(caps.get(1)?.as_str()).ok())
        .find_map(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "page_info")
                .map(|(_, value)| value.into_owned())
        })
}

/// Builds [`ShopifyClient`]s sharing one HTTP connection pool.
pub struct ShopifyProvider {
    http: Client,
    config: CatalogConfig,
    max_image_bytes: usize,
}

impl ShopifyProvider {
    /// `max_image_bytes` bounds every image download; larger bodies are
    /// refused without being read past the limit.
    pub fn new(config: &CatalogConfig, max_image_bytes: usize) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CatalogError::Fetch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            config: config.clone(),
            max_image_bytes,
        })
    }
}

impl CatalogProvider for ShopifyProvider {
    fn client_for(&self, tenant: &TenantRecord) -> Result<Box<dyn CatalogClient>, CatalogError> {
        let client = ShopifyClient {
            http: self.http.clone(),
            base_url: shop_base_url(&tenant.shop_domain)?,
            access_token: tenant.access_token.clone(),
            api_version: self.config.api_version.clone(),
            page_limit: self.config.page_limit.clamp(1, MAX_PAGE_LIMIT),
            max_image_bytes: self.max_image_bytes,
        };
        Ok(Box::new(client))
    }
}

pub struct ShopifyClient {
    http: Client,
    base_url: Url,
    access_token: String,
    api_version: String,
    page_limit: u32,
    max_image_bytes: usize,
}

impl ShopifyClient {
    fn admin_url(&self, resource: &str) -> Result<Url, CatalogError> {
        self.base_url
            .join(&format!("/admin/api/{}/{resource}", self.api_version))
            .map_err(|e| CatalogError::Fetch(format!("invalid admin url: {e}")))
    }

    fn products_url(&self, cursor: Option<&str>) -> Result<Url, CatalogError> {
        let mut url = self.admin_url("products.json")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("page_info", cursor);
            }
        }
        Ok(url)
    }

    fn get_admin(&self, url: Url) -> reqwest::Result<Response> {
        self.http
            .get(url)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .send()
    }
}

impl CatalogClient for ShopifyClient {
    fn validate_credential(&self) -> Result<(), CatalogError> {
        let url = self.admin_url("shop.json")?;
        let resp = self
            .get_admin(url)
            .map_err(|e| CatalogError::Auth(format!("shop.json request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CatalogError::Auth(format!(
                "shop.json returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage, CatalogError> {
        let url = self.products_url(cursor)?;
        log::debug!("{}: requesting products page", self.base_url);

        let resp = self
            .get_admin(url)
            .map_err(|e| CatalogError::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CatalogError::Fetch(format!("products.json returned {status}")));
        }

        let next_cursor = resp
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_next_cursor);

        let body: ProductsResponse = resp
            .json()
            .map_err(|e| CatalogError::Fetch(format!("malformed products response: {e}")))?;

        Ok(CatalogPage {
            items: body.products.into_iter().map(CatalogItem::from).collect(),
            next_cursor,
        })
    }

    fn download_image(&self, url: &str) -> Result<Vec<u8>, CatalogError> {
        let resp = self
            .http
            .get(url)
            .send()
            .map_err(|e| CatalogError::Download(format!("{url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CatalogError::Download(format!("{url}: HTTP {status}")));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(CatalogError::Download(format!(
                "{url}: invalid content type {content_type:?}"
            )));
        }

        let max = self.max_image_bytes;
        if let Some(len) = resp.content_length().filter(|len| *len > max as u64) {
            return Err(CatalogError::Download(format!(
                "{url}: image of {len} bytes exceeds {max} bytes"
            )));
        }

        // One byte past the limit tells an oversized body from an exact fit.
        let mut bytes = Vec::new();
        resp.take(max as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|e| CatalogError::Download(format!("{url}: {e}")))?;
        if bytes.len() > max {
            return Err(CatalogError::Download(format!(
                "{url}: image exceeds {max} bytes"
            )));
        }

        if !infer::is_image(&bytes) {
            return Err(CatalogError::Download(format!(
                "{url}: body is not an image"
            )));
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Cursor, Write};
    use std::net::{Shutdown, TcpListener};

    use super::*;

    fn raw_response(status: &str, content_type: &str, body: &[u8], sized: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nConnection: close\r\n");
        if sized {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");
        let mut raw = head.into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    /// Serves canned responses by request path on a local port, one
    /// connection per request.
    fn image_host(routes: Vec<(&'static str, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                let _ = reader.read_line(&mut request_line);
                loop {
                    let mut header = String::new();
                    if reader.read_line(&mut header).unwrap_or(0) <= 2 {
                        break;
                    }
                }

                let path = request_line.split_whitespace().nth(1).unwrap_or("/");
                let reply = routes
                    .iter()
                    .find(|(route, _)| *route == path)
                    .map(|(_, reply)| reply.clone())
                    .unwrap_or_else(|| raw_response("404 Not Found", "text/plain", b"", true));
                let _ = stream.write_all(&reply);
                let _ = stream.shutdown(Shutdown::Write);
            }
        });
        format!("http://{addr}")
    }

    fn png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 30, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn client(max_image_bytes: usize) -> ShopifyClient {
        ShopifyClient {
            http: Client::builder().no_proxy().build().unwrap(),
            base_url: shop_base_url("acme").unwrap(),
            access_token: "shpat_test".to_string(),
            api_version: "2023-10".to_string(),
            page_limit: 250,
            max_image_bytes,
        }
    }

    fn download_error(client: &ShopifyClient, url: &str) -> String {
        match client.download_image(url) {
            Err(CatalogError::Download(msg)) => msg,
            other => panic!("expected a download error for {url}, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_next_cursor() {
        let header = r#"<https://acme.myshopify.com/admin/api/2023-10/products.json?limit=250&page_info=eyJsYXN0X2lkIjo0fQ>; rel="next""#;
        assert_eq!(
            parse_next_cursor(header).as_deref(),
            Some("eyJsYXN0X2lkIjo0fQ")
        );
    }

    #[test]
    fn test_parse_next_cursor_with_previous() {
        let header = concat!(
            r#"<https://acme.myshopify.com/admin/api/2023-10/products.json?page_info=prev123&limit=250>; rel="previous", "#,
            r#"<https://acme.myshopify.com/admin/api/2023-10/products.json?page_info=next456&limit=250>; rel="next""#
        );
        assert_eq!(parse_next_cursor(header).as_deref(), Some("next456"));
    }

    #[test]
    fn test_parse_next_cursor_last_page() {
        let header = r#"<https://acme.myshopify.com/admin/api/2023-10/products.json?page_info=prev123>; rel="previous""#;
        assert_eq!(parse_next_cursor(header), None);
        assert_eq!(parse_next_cursor(""), None);
    }

    #[test]
    fn test_product_extraction_uses_first_image() {
        let body = r#"{"products": [
            {"id": 632910392, "title": "IPod Nano", "handle": "ipod-nano",
             "images": [{"src": "https://cdn.shopify.com/a.jpg"}, {"src": "https://cdn.shopify.com/b.jpg"}]},
            {"id": 921728736, "title": "IPod Touch", "handle": "ipod-touch", "images": []},
            {"id": 5, "images": [{"src": ""}]}
        ]}"#;
        let parsed: ProductsResponse = serde_json::from_str(body).unwrap();
        let items: Vec<CatalogItem> = parsed.products.into_iter().map(CatalogItem::from).collect();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].item_id, "632910392");
        assert_eq!(items[0].handle, "ipod-nano");
        assert_eq!(
            items[0].image_url.as_deref(),
            Some("https://cdn.shopify.com/a.jpg")
        );
        assert_eq!(items[1].image_url, None);
        assert_eq!(items[2].title, "");
        assert_eq!(items[2].image_url, None);
    }

    #[test]
    fn test_shop_base_url() {
        assert_eq!(
            shop_base_url("acme").unwrap().as_str(),
            "https://acme.myshopify.com/"
        );
        assert_eq!(
            shop_base_url("acme.myshopify.com").unwrap().as_str(),
            "https://acme.myshopify.com/"
        );
        assert!(shop_base_url("bad domain").is_err());
    }

    #[test]
    fn test_products_url() {
        let client = ShopifyClient {
            http: Client::new(),
            base_url: shop_base_url("acme").unwrap(),
            access_token: "shpat_test".to_string(),
            api_version: "2023-10".to_string(),
            page_limit: 250,
            max_image_bytes: 1024,
        };

        assert_eq!(
            client.products_url(None).unwrap().as_str(),
            "https://acme.myshopify.com/admin/api/2023-10/products.json?limit=250"
        );
        assert_eq!(
            client.products_url(Some("abc")).unwrap().as_str(),
            "https://acme.myshopify.com/admin/api/2023-10/products.json?limit=250&page_info=abc"
        );
    }

    #[test]
    fn test_download_image_checks_response() {
        let png = png();
        assert!(png.len() < 1024);
        let mut oversized = png.clone();
        oversized.resize(4096, 0);

        let host = image_host(vec![
            ("/ok.png", raw_response("200 OK", "image/png", &png, true)),
            ("/missing.png", raw_response("404 Not Found", "image/png", b"gone", true)),
            ("/page.png", raw_response("200 OK", "text/html; charset=utf-8", b"<html></html>", true)),
            ("/mislabelled.png", raw_response("200 OK", "image/png", b"<html>not an image</html>", true)),
            ("/huge.png", raw_response("200 OK", "image/png", &oversized, true)),
            ("/unsized.png", raw_response("200 OK", "image/png", &oversized, false)),
        ]);
        let client = client(1024);

        assert_eq!(client.download_image(&format!("{host}/ok.png")).unwrap(), png);

        assert!(download_error(&client, &format!("{host}/missing.png")).contains("404"));
        assert!(download_error(&client, &format!("{host}/page.png")).contains("invalid content type"));
        assert!(download_error(&client, &format!("{host}/mislabelled.png")).contains("not an image"));
        assert!(download_error(&client, &format!("{host}/huge.png")).contains("4096 bytes exceeds 1024"));
        assert!(download_error(&client, &format!("{host}/unsized.png")).contains("exceeds 1024 bytes"));
    }
}
